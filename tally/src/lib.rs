//! # tally
//!
//! Gauge and counter metric repository with pluggable storage backends.
//!
//! tally stores named metrics of two kinds: gauges, whose value is replaced
//! on every write, and counters, whose delta accumulates. The same update
//! logic runs over three interchangeable backends: an in-memory map, a
//! memory map persisted to a JSON snapshot file, and a SQLite database.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Records are keyed by `(kind, id)`; a gauge and a counter may share an id
//! - Callers only ever receive copies of stored records
//! - Concurrent first writers to a key are resolved, never lost
//! - Batches merge duplicate ids before a single backend round trip
//! - Database connection failures are retried on a fixed delay schedule
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tally::{BatchUpdateService, MemoryStore, MetricRequest, UpdateService};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let updates = UpdateService::new(store.clone());
//!
//! updates.update(&MetricRequest::counter("requests", 1))?;
//! let total = updates.update(&MetricRequest::counter("requests", 2))?;
//! assert_eq!(total.delta, Some(3));
//!
//! let batch = BatchUpdateService::new(store);
//! let stored = batch.update(&[
//!     MetricRequest::counter("requests", 4),
//!     MetricRequest::gauge("temperature", 21.5),
//!     MetricRequest::gauge("temperature", 22.0),
//! ])?;
//! assert_eq!(stored[0].delta, Some(7));
//! assert_eq!(stored[1].value, Some(22.0));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Repository`] - Storage contract implemented by every backend
//! - [`UpdateService`] - Single-metric upsert with gauge/counter semantics
//! - [`BatchUpdateService`] - Bulk upsert with intra-batch merging
//! - [`StorageConfig`] - Selects and opens a backend from JSON
//!
//! ## Modules
//!
//! - [`metric`] - Metric kinds, keys, records and write requests
//! - [`repository`] - The storage trait
//! - [`memory`] - Volatile in-process store
//! - [`file`] - Snapshot-persisted store and its background flusher
//! - [`snapshot`] - Snapshot file codec
//! - [`sqlite`] - SQLite store
//! - [`retry`] - Retry policy for transient database failures
//! - [`update`] / [`batch`] - Update services
//! - [`config`] - Backend configuration
//! - [`error`] - Error types

pub mod batch;
pub mod config;
pub mod error;
pub mod file;
pub mod memory;
pub mod metric;
pub mod repository;
pub mod retry;
pub mod snapshot;
pub mod sqlite;
pub mod update;

// Re-export primary API types at crate root for convenience.
pub use batch::BatchUpdateService;
pub use config::{Storage, StorageConfig};
pub use error::{Result, TallyError};
pub use file::{FileStore, FlushMode};
pub use memory::MemoryStore;
pub use metric::{Metric, MetricKey, MetricKind, MetricRequest};
pub use repository::Repository;
pub use retry::RetryPolicy;
pub use sqlite::SqliteStore;
pub use update::UpdateService;
