//! Repository contract tests run against every backend.
//!
//! Each backend must behave identically through the `Repository` trait:
//! copies out, `NotFound`/`AlreadyExists` on the right calls, partial
//! `find_batch`, and plain upserts from `create_or_update_batch`.

use std::time::Duration;

use tally::file::{FileStore, FlushMode};
use tally::memory::MemoryStore;
use tally::metric::{Metric, MetricKey, MetricKind, MetricRequest};
use tally::retry::RetryPolicy;
use tally::sqlite::SqliteStore;
use tally::Repository;
use tempfile::{TempDir, tempdir};

fn gauge(id: &str) -> MetricKey {
    MetricKey::new(MetricKind::Gauge, id)
}

fn counter(id: &str) -> MetricKey {
    MetricKey::new(MetricKind::Counter, id)
}

/// Every backend under test, with the temp dir keeping its files alive.
fn backends() -> Vec<(&'static str, Box<dyn Repository>, TempDir)> {
    let memory_dir = tempdir().unwrap();
    let file_dir = tempdir().unwrap();
    let sqlite_dir = tempdir().unwrap();

    let file = FileStore::new(file_dir.path().join("metrics.json"), FlushMode::Sync);
    let sqlite = SqliteStore::open(
        sqlite_dir.path().join("metrics.db"),
        RetryPolicy::none(),
        Duration::from_secs(1),
    )
    .unwrap();

    let memory: Box<dyn Repository> = Box::new(MemoryStore::new());
    let file: Box<dyn Repository> = Box::new(file);
    let sqlite: Box<dyn Repository> = Box::new(sqlite);

    vec![
        ("memory", memory, memory_dir),
        ("file", file, file_dir),
        ("sqlite", sqlite, sqlite_dir),
    ]
}

#[test]
fn test_create_then_find_round_trip() {
    for (name, repo, _dir) in backends() {
        let created = repo.create(&MetricRequest::gauge("temp", 21.5)).unwrap();
        assert_eq!(created, Metric::gauge("temp", 21.5), "{name}");

        let mut found = repo.find(&gauge("temp")).unwrap();
        assert_eq!(found, created, "{name}");

        // Mutating a returned record never reaches storage.
        found.value = Some(0.0);
        assert_eq!(repo.find(&gauge("temp")).unwrap().value, Some(21.5), "{name}");
    }
}

#[test]
fn test_missing_and_duplicate_keys() {
    for (name, repo, _dir) in backends() {
        assert!(repo.find(&counter("hits")).unwrap_err().is_not_found(), "{name}");
        assert!(
            repo.update(&MetricRequest::counter("hits", 1))
                .unwrap_err()
                .is_not_found(),
            "{name}"
        );

        repo.create(&MetricRequest::counter("hits", 1)).unwrap();
        assert!(
            repo.create(&MetricRequest::counter("hits", 2))
                .unwrap_err()
                .is_already_exists(),
            "{name}"
        );
        assert_eq!(repo.find(&counter("hits")).unwrap().delta, Some(1), "{name}");
    }
}

#[test]
fn test_same_id_is_distinct_per_kind() {
    for (name, repo, _dir) in backends() {
        repo.create(&MetricRequest::gauge("load", 0.5)).unwrap();
        repo.create(&MetricRequest::counter("load", 9)).unwrap();

        assert_eq!(repo.find(&gauge("load")).unwrap().value, Some(0.5), "{name}");
        assert_eq!(repo.find(&counter("load")).unwrap().delta, Some(9), "{name}");
        assert_eq!(repo.find_all().unwrap().len(), 2, "{name}");
    }
}

#[test]
fn test_update_replaces_rather_than_adds() {
    for (name, repo, _dir) in backends() {
        repo.create(&MetricRequest::counter("hits", 5)).unwrap();
        let updated = repo.update(&MetricRequest::counter("hits", 2)).unwrap();
        assert_eq!(updated.delta, Some(2), "{name}");
        assert_eq!(repo.find(&counter("hits")).unwrap().delta, Some(2), "{name}");
    }
}

#[test]
fn test_find_batch_omits_absent_keys() {
    for (name, repo, _dir) in backends() {
        repo.create(&MetricRequest::counter("a", 1)).unwrap();
        repo.create(&MetricRequest::counter("c", 3)).unwrap();

        let mut found = repo
            .find_batch(&[counter("a"), counter("b"), counter("c")])
            .unwrap();
        found.sort_by(|x, y| x.id.cmp(&y.id));

        assert_eq!(
            found,
            vec![Metric::counter("a", 1), Metric::counter("c", 3)],
            "{name}"
        );
        assert!(repo.find_batch(&[]).unwrap().is_empty(), "{name}");
    }
}

#[test]
fn test_batch_upsert_mixes_inserts_and_replacements() {
    for (name, repo, _dir) in backends() {
        repo.create(&MetricRequest::gauge("temp", 1.0)).unwrap();

        let stored = repo
            .create_or_update_batch(&[
                MetricRequest::gauge("temp", 2.0),
                MetricRequest::counter("hits", 4),
            ])
            .unwrap();
        assert_eq!(
            stored,
            vec![Metric::gauge("temp", 2.0), Metric::counter("hits", 4)],
            "{name}"
        );
        assert_eq!(repo.find_all().unwrap().len(), 2, "{name}");
        assert!(repo.create_or_update_batch(&[]).unwrap().is_empty(), "{name}");
    }
}

#[test]
fn test_ping_and_close_succeed_on_healthy_backends() {
    for (name, repo, _dir) in backends() {
        repo.ping().unwrap_or_else(|e| panic!("{name}: {e}"));
        repo.close().unwrap_or_else(|e| panic!("{name}: {e}"));
    }
}
