//! Storage configuration.
//!
//! A [`StorageConfig`] selects one backend and its settings. It is read from
//! JSON, tagged by `backend`:
//!
//! ```json
//! { "backend": "memory" }
//! { "backend": "file", "path": "/tmp/metrics-db.json", "flush_interval_secs": 300, "restore": true }
//! { "backend": "sqlite", "path": "metrics.db", "retry_delays_ms": [1000, 3000, 5000], "ping_timeout_ms": 1000 }
//! ```
//!
//! Omitted settings take the defaults shown. Unknown fields are rejected.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result, TallyError};
use crate::file::{FileStore, FlushMode};
use crate::memory::MemoryStore;
use crate::repository::Repository;
use crate::retry::RetryPolicy;
use crate::sqlite::SqliteStore;

/// Default snapshot location for the file backend.
pub const DEFAULT_FILE_PATH: &str = "/tmp/metrics-db.json";

/// Default flush interval for the file backend, in seconds.
pub const DEFAULT_FLUSH_INTERVAL_SECS: i64 = 300;

/// Default delays between database retries, in milliseconds.
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 3] = [1000, 3000, 5000];

/// Default ping timeout, in milliseconds.
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 1000;

/// Which backend to open, with its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Volatile in-process storage.
    Memory,
    /// In-memory storage persisted to a JSON snapshot.
    File(FileConfig),
    /// SQLite database.
    Sqlite(SqliteConfig),
}

/// Settings for the file backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Snapshot file path.
    pub path: PathBuf,
    /// Seconds between background flushes; `0` or less flushes on every
    /// write.
    pub flush_interval_secs: i64,
    /// Load the snapshot when opening.
    pub restore: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_FILE_PATH),
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            restore: true,
        }
    }
}

/// Settings for the SQLite backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Delays between attempts after a connection failure.
    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,
    /// Upper bound on a ping.
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
}

fn default_retry_delays_ms() -> Vec<u64> {
    DEFAULT_RETRY_DELAYS_MS.to_vec()
}

fn default_ping_timeout_ms() -> u64 {
    DEFAULT_PING_TIMEOUT_MS
}

impl SqliteConfig {
    /// Creates a config for `path` with default retry and ping settings.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            retry_delays_ms: default_retry_delays_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
        }
    }

    /// The retry policy these settings describe.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_delays_ms
                .iter()
                .map(|&ms| Duration::from_millis(ms))
                .collect(),
        )
    }

    /// The ping timeout as a [`Duration`].
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// An opened backend.
pub struct Storage {
    /// The backend, ready to hand to the update services.
    pub repository: Arc<dyn Repository>,
    /// Background flusher, present for interval-mode file storage.
    pub flusher: Option<JoinHandle<()>>,
}

impl Storage {
    /// Stops the flusher, if any, then closes the repository.
    ///
    /// `stop` must be the sender paired with the receiver passed to
    /// [`StorageConfig::open`].
    ///
    /// # Errors
    ///
    /// Returns the repository's close error, e.g. a final snapshot that
    /// could not be written.
    pub fn shutdown(self, stop: Sender<()>) -> Result<()> {
        // The flusher may already have exited; a closed channel is fine.
        let _ = stop.send(());
        if let Some(handle) = self.flusher
            && handle.join().is_err()
        {
            tracing::warn!("flusher thread panicked");
        }
        self.repository.close()
    }
}

impl StorageConfig {
    /// Reads and validates a config file.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Read`] if the file cannot be read
    /// - [`ConfigError::Parse`] or [`ConfigError::Invalid`] as for
    ///   [`StorageConfig::from_json`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&contents)
    }

    /// Parses and validates a config from JSON text.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Parse`] if the text is not a valid config
    /// - [`ConfigError::Invalid`] if a value is out of range
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse { source: e })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks settings that the types alone cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an empty path or a zero ping
    /// timeout.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Memory => Ok(()),
            Self::File(file) => {
                if file.path.as_os_str().is_empty() {
                    return Err(invalid("file backend path cannot be empty"));
                }
                Ok(())
            }
            Self::Sqlite(sqlite) => {
                if sqlite.path.as_os_str().is_empty() {
                    return Err(invalid("sqlite backend path cannot be empty"));
                }
                if sqlite.ping_timeout_ms == 0 {
                    return Err(invalid("ping_timeout_ms must be greater than zero"));
                }
                Ok(())
            }
        }
    }

    /// Builds the configured backend.
    ///
    /// File storage restores its snapshot when `restore` is set, and in
    /// interval mode starts a flusher that stops when `shutdown` receives a
    /// message or its sender is dropped.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Invalid`] if validation fails
    /// - a snapshot error from restoring or starting the flusher
    /// - a database error from opening SQLite
    pub fn open(&self, shutdown: Receiver<()>) -> Result<Storage> {
        self.validate()?;

        match self {
            Self::Memory => Ok(Storage {
                repository: Arc::new(MemoryStore::new()),
                flusher: None,
            }),
            Self::File(file) => {
                let mode = FlushMode::from_interval_secs(file.flush_interval_secs);
                let store = Arc::new(FileStore::new(&file.path, mode));
                if file.restore {
                    store.restore()?;
                }
                let flusher = FileStore::spawn_flusher(&store, shutdown)?;
                tracing::debug!(path = %file.path.display(), ?mode, "file storage opened");
                Ok(Storage {
                    repository: store,
                    flusher,
                })
            }
            Self::Sqlite(sqlite) => {
                let store =
                    SqliteStore::open(&sqlite.path, sqlite.retry_policy(), sqlite.ping_timeout())?;
                Ok(Storage {
                    repository: Arc::new(store),
                    flusher: None,
                })
            }
        }
    }
}

fn invalid(reason: &str) -> TallyError {
    ConfigError::Invalid {
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricRequest;
    use std::sync::mpsc;
    use tempfile::tempdir;

    #[test]
    fn test_memory_config() {
        assert_eq!(
            StorageConfig::from_json(r#"{ "backend": "memory" }"#).unwrap(),
            StorageConfig::Memory
        );
    }

    #[test]
    fn test_file_defaults() {
        let config = StorageConfig::from_json(r#"{ "backend": "file" }"#).unwrap();
        assert_eq!(config, StorageConfig::File(FileConfig::default()));

        let StorageConfig::File(file) = config else {
            panic!("expected file config");
        };
        assert_eq!(file.path, PathBuf::from("/tmp/metrics-db.json"));
        assert_eq!(file.flush_interval_secs, 300);
        assert!(file.restore);
    }

    #[test]
    fn test_sqlite_defaults() {
        let config =
            StorageConfig::from_json(r#"{ "backend": "sqlite", "path": "metrics.db" }"#).unwrap();
        let StorageConfig::Sqlite(sqlite) = config else {
            panic!("expected sqlite config");
        };
        assert_eq!(sqlite.retry_policy(), RetryPolicy::default());
        assert_eq!(
            sqlite.retry_policy().delays(),
            &[Duration::from_secs(1), Duration::from_secs(3), Duration::from_secs(5)]
        );
        assert_eq!(sqlite.ping_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_sqlite_requires_path() {
        let err = StorageConfig::from_json(r#"{ "backend": "sqlite" }"#).unwrap_err();
        assert!(matches!(err, TallyError::Config(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_unknown_backend_and_fields_are_rejected() {
        for json in [
            r#"{ "backend": "redis" }"#,
            r#"{ "backend": "file", "flush_every": 10 }"#,
        ] {
            let err = StorageConfig::from_json(json).unwrap_err();
            assert!(matches!(err, TallyError::Config(ConfigError::Parse { .. })), "{json}");
        }
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        for json in [
            r#"{ "backend": "file", "path": "" }"#,
            r#"{ "backend": "sqlite", "path": "m.db", "ping_timeout_ms": 0 }"#,
        ] {
            let err = StorageConfig::from_json(json).unwrap_err();
            assert!(matches!(err, TallyError::Config(ConfigError::Invalid { .. })), "{json}");
        }
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let dir = tempdir().unwrap();
        let err = StorageConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, TallyError::Config(ConfigError::Read { .. })));
    }

    #[test]
    fn test_open_file_backend_restores_and_spawns_flusher() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, r#"[{ "id": "hits", "type": "counter", "delta": 4 }]"#).unwrap();

        let config = StorageConfig::File(FileConfig {
            path: path.clone(),
            flush_interval_secs: 60,
            restore: true,
        });
        let (stop, shutdown) = mpsc::channel();
        let storage = config.open(shutdown).unwrap();
        assert!(storage.flusher.is_some());

        let restored = storage.repository.find_all().unwrap();
        assert_eq!(restored.len(), 1);

        storage
            .repository
            .create(&MetricRequest::gauge("temp", 2.5))
            .unwrap();
        storage.shutdown(stop).unwrap();

        // Close flushed the pending write.
        let snapshot = std::fs::read_to_string(&path).unwrap();
        assert!(snapshot.contains("temp"));
    }

    #[test]
    fn test_open_without_restore_ignores_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, r#"[{ "id": "hits", "type": "counter", "delta": 4 }]"#).unwrap();

        let config = StorageConfig::File(FileConfig {
            path,
            flush_interval_secs: 0,
            restore: false,
        });
        let (_stop, shutdown) = mpsc::channel();
        let storage = config.open(shutdown).unwrap();
        assert!(storage.flusher.is_none());
        assert!(storage.repository.find_all().unwrap().is_empty());
    }

    #[test]
    fn test_open_sqlite_backend() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::Sqlite(SqliteConfig::new(dir.path().join("metrics.db")));
        let (stop, shutdown) = mpsc::channel();
        let storage = config.open(shutdown).unwrap();
        storage.repository.ping().unwrap();
        storage.shutdown(stop).unwrap();
    }
}
