//! Single-metric upsert with gauge/counter semantics.
//!
//! [`UpdateService`] turns one [`MetricRequest`] into a stored record:
//!
//! 1. Look the key up.
//! 2. If it is missing, try to create it. A concurrent writer may win the
//!    race, in which case `create` reports `AlreadyExists` and the record is
//!    looked up again.
//! 3. With a stored record in hand, gauges replace the value and counters
//!    add the request delta to the stored delta.
//!
//! The repository's own `find`/`create`/`update` are used as is, so the same
//! service drives every backend.

use std::sync::Arc;

use crate::error::Result;
use crate::metric::{Metric, MetricKey, MetricRequest};
use crate::repository::Repository;

/// Applies metric writes against a [`Repository`].
#[derive(Clone)]
pub struct UpdateService {
    repository: Arc<dyn Repository>,
}

impl UpdateService {
    /// Creates a service writing through `repository`.
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Validates and applies `request`, returning the stored record.
    ///
    /// # Errors
    ///
    /// - [`crate::error::MetricError`] if the request is malformed or a
    ///   counter would overflow
    /// - any repository error other than the `NotFound`/`AlreadyExists`
    ///   conditions the create race produces
    pub fn update(&self, request: &MetricRequest) -> Result<Metric> {
        request.validate()?;
        let key = request.key();

        let stored = match self.repository.find(&key) {
            Ok(stored) => stored,
            Err(e) if e.is_not_found() => match self.repository.create(request) {
                Ok(created) => {
                    tracing::debug!(%key, "metric created");
                    return Ok(created);
                }
                Err(e) if e.is_already_exists() => {
                    tracing::debug!(%key, "lost create race, updating instead");
                    self.repository.find(&key)?
                }
                Err(e) => return Err(e),
            },
            Err(e) => return Err(e),
        };

        match request.accumulate(&stored)? {
            Some(next) => self.repository.update(&next),
            None => Ok(stored),
        }
    }

    /// Returns the record stored under `key`.
    ///
    /// # Errors
    ///
    /// [`crate::TallyError::NotFound`] if absent, or a backend error.
    pub fn find(&self, key: &MetricKey) -> Result<Metric> {
        self.repository.find(key)
    }

    /// Returns every stored record sorted by kind, then id.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the records cannot be read.
    pub fn find_all(&self) -> Result<Vec<Metric>> {
        let mut records = self.repository.find_all()?;
        records.sort_by(|a, b| (a.kind, &a.id).cmp(&(b.kind, &b.id)));
        Ok(records)
    }

    /// Checks backend connectivity.
    ///
    /// # Errors
    ///
    /// Returns the backend's ping error.
    pub fn ping(&self) -> Result<()> {
        self.repository.ping()
    }
}
