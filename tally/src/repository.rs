//! The storage contract shared by every backend.
//!
//! [`crate::memory::MemoryStore`], [`crate::file::FileStore`] and
//! [`crate::sqlite::SqliteStore`] all implement [`Repository`], and the
//! update services only ever talk to a `dyn Repository`.
//!
//! Every method takes its input by reference and returns owned values: a
//! store never keeps a reference into caller memory and a caller can never
//! reach stored state through a returned [`Metric`].

use crate::error::Result;
use crate::metric::{Metric, MetricKey, MetricRequest};

/// Storage for metric records keyed by `(kind, id)`.
pub trait Repository: Send + Sync {
    /// Returns the record stored under `key`.
    ///
    /// # Errors
    ///
    /// [`crate::TallyError::NotFound`] if no record exists, or a backend
    /// error.
    fn find(&self, key: &MetricKey) -> Result<Metric>;

    /// Returns every stored record. Order is backend-defined.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the records cannot be read.
    fn find_all(&self) -> Result<Vec<Metric>>;

    /// Returns the records for the keys that exist; absent keys are omitted
    /// rather than reported.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the records cannot be read.
    fn find_batch(&self, keys: &[MetricKey]) -> Result<Vec<Metric>>;

    /// Stores a new record.
    ///
    /// # Errors
    ///
    /// [`crate::TallyError::AlreadyExists`] if the key is taken, or a
    /// backend error.
    fn create(&self, request: &MetricRequest) -> Result<Metric>;

    /// Overwrites the fields the request populates on an existing record.
    ///
    /// # Errors
    ///
    /// [`crate::TallyError::NotFound`] if no record exists, or a backend
    /// error.
    fn update(&self, request: &MetricRequest) -> Result<Metric>;

    /// Inserts or replaces every request in one call.
    ///
    /// Rows are plain upserts: no accumulation happens here.
    ///
    /// # Errors
    ///
    /// Returns a backend error; backends that support it apply the batch
    /// all-or-nothing.
    fn create_or_update_batch(&self, requests: &[MetricRequest]) -> Result<Vec<Metric>>;

    /// Checks backend connectivity.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the backend is unreachable.
    fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Releases backend resources.
    ///
    /// # Errors
    ///
    /// Returns a backend error if pending state cannot be persisted.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}
