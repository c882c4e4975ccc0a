//! Bulk upsert with intra-batch merging.
//!
//! A batch is reduced before it reaches the repository: counter deltas that
//! share an id are summed, and repeated gauges keep only their last value.
//! Stored counter totals are then fetched with a single
//! [`Repository::find_batch`] and added in, and the merged requests go to
//! [`Repository::create_or_update_batch`] in one call.
//!
//! The result lists counters first, then gauges, each in the order their id
//! first appeared in the batch.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{MetricError, Result};
use crate::metric::{Metric, MetricKind, MetricRequest};
use crate::repository::Repository;

/// Applies batches of metric writes against a [`Repository`].
#[derive(Clone)]
pub struct BatchUpdateService {
    repository: Arc<dyn Repository>,
}

/// Requests of one kind, merged per id in first-appearance order.
#[derive(Default)]
struct Merged {
    requests: Vec<MetricRequest>,
    index: HashMap<String, usize>,
}

impl Merged {
    /// Returns the slot for `request`'s id and whether it was just added.
    fn entry(&mut self, request: &MetricRequest) -> (usize, bool) {
        if let Some(&pos) = self.index.get(&request.id) {
            return (pos, false);
        }
        let pos = self.requests.len();
        self.index.insert(request.id.clone(), pos);
        self.requests.push(request.clone());
        (pos, true)
    }
}

impl BatchUpdateService {
    /// Creates a service writing through `repository`.
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Validates, merges and stores `requests`, returning the stored records.
    ///
    /// Every request must carry the field for its kind. Nothing is written
    /// if any request is invalid. Counter deltas are summed exactly, so only
    /// a final total outside `i64` is an overflow.
    ///
    /// # Errors
    ///
    /// - [`crate::error::MetricError`] for an invalid request or a counter
    ///   total that overflows `i64`
    /// - any error from `find_batch` or `create_or_update_batch`
    pub fn update(&self, requests: &[MetricRequest]) -> Result<Vec<Metric>> {
        let mut counters = Merged::default();
        let mut gauges = Merged::default();
        // Running counter sums, parallel to `counters.requests`.
        let mut sums: Vec<i128> = Vec::new();

        for request in requests {
            request.validate_write()?;
            match request.kind {
                MetricKind::Counter => {
                    let (pos, added) = counters.entry(request);
                    if added {
                        sums.push(0);
                    }
                    sums[pos] += i128::from(request.delta.unwrap_or(0));
                }
                MetricKind::Gauge => {
                    let (pos, added) = gauges.entry(request);
                    if !added {
                        gauges.requests[pos].value = request.value;
                    }
                }
            }
        }

        if !counters.requests.is_empty() {
            let keys: Vec<_> = counters.requests.iter().map(MetricRequest::key).collect();
            let mut stored_deltas = vec![0i64; counters.requests.len()];
            for stored in self.repository.find_batch(&keys)? {
                if stored.kind != MetricKind::Counter {
                    continue;
                }
                if let Some(&pos) = counters.index.get(&stored.id) {
                    stored_deltas[pos] = stored.delta.unwrap_or(0);
                }
            }

            for (pos, merged) in counters.requests.iter_mut().enumerate() {
                let current = stored_deltas[pos];
                let total = sums[pos] + i128::from(current);
                let total = i64::try_from(total).map_err(|_| MetricError::CounterOverflow {
                    id: merged.id.clone(),
                    current,
                    delta: saturate(sums[pos]),
                })?;
                merged.delta = Some(total);
            }
        }

        let mut combined = counters.requests;
        combined.extend(gauges.requests);
        if combined.is_empty() {
            return Ok(Vec::new());
        }

        tracing::debug!(
            requests = requests.len(),
            merged = combined.len(),
            "applying metric batch"
        );
        self.repository.create_or_update_batch(&combined)
    }
}

/// Clamps an exact sum into `i64` for error reporting.
fn saturate(sum: i128) -> i64 {
    i64::try_from(sum).unwrap_or(if sum < 0 { i64::MIN } else { i64::MAX })
}
