//! SQLite-backed metric store.
//!
//! Records live in a `metrics(kind, id, value, delta)` table keyed on
//! `(kind, id)`. Every operation opens its own connection, so the process
//! holds no lock across database calls and concurrent writers meet at the
//! primary key, where a losing `create` surfaces as
//! [`TallyError::AlreadyExists`].
//!
//! Every data operation runs under the store's [`RetryPolicy`]. Only
//! connection failures (see [`TallyError::is_connection_exception`]) are
//! retried; constraint, query and not-found errors return immediately.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tally::metric::{MetricKey, MetricKind, MetricRequest};
//! use tally::retry::RetryPolicy;
//! use tally::sqlite::SqliteStore;
//! use tally::Repository;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStore::open("metrics.db", RetryPolicy::default(), Duration::from_secs(1))?;
//! store.ping()?;
//!
//! store.create(&MetricRequest::counter("hits", 1))?;
//! let hits = store.find(&MetricKey::new(MetricKind::Counter, "hits"))?;
//! assert_eq!(hits.delta, Some(1));
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, ErrorCode, Row, params};

use crate::error::{DatabaseError, MetricError, Result, TallyError};
use crate::metric::{Metric, MetricKey, MetricKind, MetricRequest};
use crate::repository::Repository;
use crate::retry::RetryPolicy;

/// Current schema version recorded in `schema_version`.
const SCHEMA_VERSION: i64 = 1;

/// How long a connection waits on a locked database before failing busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Keys per `find_batch` query. Each key binds two parameters, which keeps
/// a chunk under SQLite's historical 999-parameter limit.
const BATCH_KEY_CHUNK: usize = 400;

/// VM instructions between ping deadline checks.
const PING_PROGRESS_OPS: i32 = 100;

const MIGRATION_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS metrics (
    kind  TEXT NOT NULL,
    id    TEXT NOT NULL,
    value REAL,
    delta INTEGER,
    PRIMARY KEY (kind, id)
);
";

const PING_SQL: &str = "SELECT COUNT(*) FROM sqlite_master";

const SELECT_COLUMNS: &str = "SELECT kind, id, value, delta FROM metrics";

const FIND_SQL: &str = "SELECT kind, id, value, delta FROM metrics WHERE kind = ?1 AND id = ?2";

const FIND_ALL_SQL: &str = "SELECT kind, id, value, delta FROM metrics ORDER BY kind, id";

const CREATE_SQL: &str = "INSERT INTO metrics (kind, id, value, delta) VALUES (?1, ?2, ?3, ?4)
     RETURNING kind, id, value, delta";

const UPDATE_SQL: &str = "UPDATE metrics SET value = COALESCE(?3, value), delta = COALESCE(?4, delta)
     WHERE kind = ?1 AND id = ?2
     RETURNING kind, id, value, delta";

const UPSERT_SQL: &str = "INSERT INTO metrics (kind, id, value, delta) VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT (kind, id) DO UPDATE SET value = excluded.value, delta = excluded.delta
     RETURNING kind, id, value, delta";

impl ToSql for MetricKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MetricKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: MetricError| FromSqlError::Other(Box::new(e)))
    }
}

/// [`Repository`] over a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    retry: RetryPolicy,
    ping_timeout: Duration,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema.
    ///
    /// # Errors
    ///
    /// - [`DatabaseError::Query`] if the database cannot be opened once the
    ///   retry delays are exhausted
    /// - [`DatabaseError::Migration`] if the schema cannot be applied
    pub fn open<P: AsRef<Path>>(path: P, retry: RetryPolicy, ping_timeout: Duration) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            retry,
            ping_timeout,
        };

        store.with_retry(|| {
            let conn = store.connect(BUSY_TIMEOUT)?;
            migrate(&conn)
        })?;

        tracing::debug!(path = %store.path.display(), "sqlite store ready");
        Ok(store)
    }

    /// Returns the database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn connect(&self, busy_timeout: Duration) -> Result<Connection> {
        let conn =
            Connection::open(&self.path).map_err(|e| DatabaseError::query("connect", e))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| DatabaseError::query("connect", e))?;
        Ok(conn)
    }

    fn with_retry<T>(&self, op: impl FnMut() -> Result<T>) -> Result<T> {
        self.retry.run(TallyError::is_connection_exception, op)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| DatabaseError::query("configure", e))?;

    conn.execute_batch(MIGRATION_SQL)
        .map_err(|e| DatabaseError::Migration { source: e })?;

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
        .map_err(|e| DatabaseError::Migration { source: e })?;
    if count == 0 {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )
        .map_err(|e| DatabaseError::Migration { source: e })?;
    }
    Ok(())
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<Metric> {
    Ok(Metric {
        kind: row.get(0)?,
        id: row.get(1)?,
        value: row.get(2)?,
        delta: row.get(3)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl Repository for SqliteStore {
    fn find(&self, key: &MetricKey) -> Result<Metric> {
        self.with_retry(|| {
            let conn = self.connect(BUSY_TIMEOUT)?;
            conn.query_row(FIND_SQL, params![key.kind, key.id], map_row)
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => TallyError::NotFound { key: key.clone() },
                    e => DatabaseError::keyed("find", key, e).into(),
                })
        })
    }

    fn find_all(&self) -> Result<Vec<Metric>> {
        self.with_retry(|| {
            let conn = self.connect(BUSY_TIMEOUT)?;
            let mut stmt = conn
                .prepare(FIND_ALL_SQL)
                .map_err(|e| DatabaseError::query("find_all", e))?;
            let rows = stmt
                .query_map([], map_row)
                .map_err(|e| DatabaseError::query("find_all", e))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| DatabaseError::query("find_all", e).into())
        })
    }

    fn find_batch(&self, keys: &[MetricKey]) -> Result<Vec<Metric>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        self.with_retry(|| {
            let conn = self.connect(BUSY_TIMEOUT)?;
            let mut found = Vec::with_capacity(keys.len());

            for chunk in keys.chunks(BATCH_KEY_CHUNK) {
                let filter = vec!["(kind = ? AND id = ?)"; chunk.len()].join(" OR ");
                let sql = format!("{SELECT_COLUMNS} WHERE {filter}");
                let params: Vec<&dyn ToSql> = chunk
                    .iter()
                    .flat_map(|key| [&key.kind as &dyn ToSql, &key.id as &dyn ToSql])
                    .collect();

                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| DatabaseError::query("find_batch", e))?;
                let rows = stmt
                    .query_map(params.as_slice(), map_row)
                    .map_err(|e| DatabaseError::query("find_batch", e))?;
                for row in rows {
                    found.push(row.map_err(|e| DatabaseError::query("find_batch", e))?);
                }
            }

            Ok(found)
        })
    }

    fn create(&self, request: &MetricRequest) -> Result<Metric> {
        let key = request.key();
        self.with_retry(|| {
            let conn = self.connect(BUSY_TIMEOUT)?;
            conn.query_row(
                CREATE_SQL,
                params![request.kind, request.id, request.value, request.delta],
                map_row,
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    TallyError::AlreadyExists { key: key.clone() }
                } else {
                    DatabaseError::keyed("create", &key, e).into()
                }
            })
        })
    }

    fn update(&self, request: &MetricRequest) -> Result<Metric> {
        let key = request.key();
        self.with_retry(|| {
            let conn = self.connect(BUSY_TIMEOUT)?;
            conn.query_row(
                UPDATE_SQL,
                params![request.kind, request.id, request.value, request.delta],
                map_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => TallyError::NotFound { key: key.clone() },
                e => DatabaseError::keyed("update", &key, e).into(),
            })
        })
    }

    fn create_or_update_batch(&self, requests: &[MetricRequest]) -> Result<Vec<Metric>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        self.with_retry(|| {
            let mut conn = self.connect(BUSY_TIMEOUT)?;
            // Dropping the transaction without commit rolls everything back.
            let tx = conn
                .transaction()
                .map_err(|e| DatabaseError::query("begin batch", e))?;

            let mut stored = Vec::with_capacity(requests.len());
            {
                let mut stmt = tx
                    .prepare(UPSERT_SQL)
                    .map_err(|e| DatabaseError::query("upsert", e))?;
                for request in requests {
                    let metric = stmt
                        .query_row(
                            params![request.kind, request.id, request.value, request.delta],
                            map_row,
                        )
                        .map_err(|e| DatabaseError::keyed("upsert", &request.key(), e))?;
                    stored.push(metric);
                }
            }

            tx.commit()
                .map_err(|e| DatabaseError::query("commit batch", e))?;
            tracing::debug!(rows = stored.len(), "batch committed");
            Ok(stored)
        })
    }

    /// Runs a schema read bounded by the ping timeout. Not retried.
    fn ping(&self) -> Result<()> {
        self.query_bounded(PING_SQL)
    }
}

impl SqliteStore {
    /// Runs a single-value query on a fresh connection, interrupting it once
    /// the ping timeout has elapsed.
    fn query_bounded(&self, sql: &str) -> Result<()> {
        let conn = self.connect(self.ping_timeout)?;
        let deadline = Instant::now() + self.ping_timeout;
        conn.progress_handler(PING_PROGRESS_OPS, Some(move || Instant::now() >= deadline));

        match conn.query_row(sql, [], |row| row.get::<_, i64>(0)) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    ErrorCode::OperationInterrupted
                        | ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                ) =>
            {
                Err(DatabaseError::PingTimeout {
                    timeout: self.ping_timeout,
                }
                .into())
            }
            Err(e) => Err(DatabaseError::query("ping", e).into()),
        }
    }
}
