//! Durable file-backed metric store.
//!
//! [`FileStore`] owns a [`MemoryStore`] and persists it as a JSON snapshot
//! (see [`crate::snapshot`]). Reads go straight to the memory store; writes
//! are intercepted to mark the store dirty and, depending on the
//! [`FlushMode`], to flush before returning.
//!
//! # Flush modes
//!
//! - [`FlushMode::Sync`]: every successful write has reached disk by the
//!   time it returns. A failed flush is returned to the caller, but the
//!   in-memory write is kept.
//! - [`FlushMode::Interval`]: writes only set the dirty flag. A background
//!   thread started with [`FileStore::spawn_flusher`] writes the snapshot
//!   each interval if anything changed.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::{mpsc, Arc};
//! use std::time::Duration;
//! use tally::file::{FileStore, FlushMode};
//! use tally::metric::MetricRequest;
//! use tally::Repository;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(FileStore::new("/tmp/metrics-db.json", FlushMode::Interval(Duration::from_secs(300))));
//! store.restore()?;
//!
//! let (stop, shutdown) = mpsc::channel();
//! let flusher = FileStore::spawn_flusher(&store, shutdown)?;
//!
//! store.create(&MetricRequest::gauge("temp", 21.5))?;
//!
//! // Stop the flusher and persist whatever is pending.
//! let _ = stop.send(());
//! if let Some(handle) = flusher {
//!     let _ = handle.join();
//! }
//! store.flush()?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Result, SnapshotError};
use crate::memory::MemoryStore;
use crate::metric::{Metric, MetricKey, MetricRequest};
use crate::repository::Repository;
use crate::snapshot;

/// Name of the background flusher thread.
pub const FLUSHER_THREAD_NAME: &str = "tally-flusher";

/// When a [`FileStore`] writes its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Flush inside every write call.
    Sync,
    /// Flush from a background thread at this interval.
    Interval(Duration),
}

impl FlushMode {
    /// Maps a configured interval in seconds to a mode: `<= 0` is
    /// synchronous.
    pub fn from_interval_secs(secs: i64) -> Self {
        match u64::try_from(secs) {
            Ok(secs) if secs > 0 => Self::Interval(Duration::from_secs(secs)),
            _ => Self::Sync,
        }
    }
}

/// Snapshot-persisted [`Repository`] layered over a [`MemoryStore`].
#[derive(Debug)]
pub struct FileStore {
    memory: MemoryStore,
    path: PathBuf,
    mode: FlushMode,
    /// Dirty flag. Held for the whole of every write and flush so a flush
    /// never sees a half-applied write.
    dirty: Mutex<bool>,
}

impl FileStore {
    /// Creates an empty store that snapshots to `path`.
    ///
    /// Nothing is read from disk; call [`FileStore::restore`] to load an
    /// existing snapshot.
    pub fn new<P: AsRef<Path>>(path: P, mode: FlushMode) -> Self {
        Self {
            memory: MemoryStore::new(),
            path: path.as_ref().to_path_buf(),
            mode,
            dirty: Mutex::new(false),
        }
    }

    /// Loads the snapshot into memory, replacing current contents.
    ///
    /// A missing or empty snapshot file leaves the store as it is.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::SnapshotError`] if the file cannot be read or
    /// is malformed.
    pub fn restore(&self) -> Result<()> {
        let mut dirty = self.lock_dirty();
        let Some(records) = snapshot::read(&self.path)? else {
            tracing::debug!(path = %self.path.display(), "no snapshot to restore");
            return Ok(());
        };

        let count = records.len();
        self.memory.fill(records);
        *dirty = false;
        tracing::info!(path = %self.path.display(), count, "restored metrics from snapshot");
        Ok(())
    }

    /// Writes the snapshot if there are unflushed changes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::SnapshotError`] if the snapshot cannot be
    /// written; the store stays dirty.
    pub fn flush(&self) -> Result<()> {
        let mut dirty = self.lock_dirty();
        self.flush_locked(&mut dirty)
    }

    /// Starts the background flusher for [`FlushMode::Interval`] stores.
    ///
    /// The thread wakes every interval and flushes if dirty. It stops when a
    /// message arrives on `shutdown` or its sender is dropped, without a
    /// final flush. Flush failures are logged and retried on the next tick.
    ///
    /// Returns `None` for [`FlushMode::Sync`] stores, which need no thread.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::SpawnFlusher`] if the thread cannot be
    /// started.
    pub fn spawn_flusher(
        store: &Arc<Self>,
        shutdown: Receiver<()>,
    ) -> Result<Option<JoinHandle<()>>> {
        let FlushMode::Interval(interval) = store.mode() else {
            return Ok(None);
        };

        let store = Arc::clone(store);
        let handle = thread::Builder::new()
            .name(FLUSHER_THREAD_NAME.to_string())
            .spawn(move || {
                loop {
                    match shutdown.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = store.flush() {
                                tracing::warn!("background flush failed: {e}");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!(path = %store.path.display(), "flusher stopped");
            })
            .map_err(|e| SnapshotError::SpawnFlusher { source: e })?;
        Ok(Some(handle))
    }

    /// Returns `true` if there are changes not yet written to disk.
    pub fn is_dirty(&self) -> bool {
        *self.lock_dirty()
    }

    /// Returns the snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the flush mode.
    pub fn mode(&self) -> FlushMode {
        self.mode
    }

    fn flush_locked(&self, dirty: &mut bool) -> Result<()> {
        if !*dirty {
            return Ok(());
        }

        // Insertion order, so a restore reproduces `find_all` exactly.
        let records = self.memory.find_all()?;
        snapshot::write(&self.path, &records)?;

        *dirty = false;
        tracing::debug!(path = %self.path.display(), count = records.len(), "snapshot written");
        Ok(())
    }

    /// Runs a write against the memory store under the dirty lock, then
    /// flushes in sync mode.
    fn write<T>(&self, op: impl FnOnce(&MemoryStore) -> Result<T>) -> Result<T> {
        let mut dirty = self.lock_dirty();
        let out = op(&self.memory)?;
        *dirty = true;

        if self.mode == FlushMode::Sync {
            self.flush_locked(&mut dirty)?;
        }
        Ok(out)
    }

    fn lock_dirty(&self) -> MutexGuard<'_, bool> {
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Repository for FileStore {
    fn find(&self, key: &MetricKey) -> Result<Metric> {
        self.memory.find(key)
    }

    fn find_all(&self) -> Result<Vec<Metric>> {
        self.memory.find_all()
    }

    fn find_batch(&self, keys: &[MetricKey]) -> Result<Vec<Metric>> {
        self.memory.find_batch(keys)
    }

    fn create(&self, request: &MetricRequest) -> Result<Metric> {
        self.write(|memory| memory.create(request))
    }

    fn update(&self, request: &MetricRequest) -> Result<Metric> {
        self.write(|memory| memory.update(request))
    }

    fn create_or_update_batch(&self, requests: &[MetricRequest]) -> Result<Vec<Metric>> {
        self.write(|memory| memory.create_or_update_batch(requests))
    }

    /// Flushes pending changes.
    fn close(&self) -> Result<()> {
        self.flush()
    }
}
