//! Integration tests for snapshot persistence across store lifetimes.

use std::fs;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tally::file::{FileStore, FlushMode};
use tally::metric::{Metric, MetricKey, MetricKind, MetricRequest};
use tally::{Repository, UpdateService};
use tempfile::tempdir;

fn read_snapshot(path: &std::path::Path) -> Vec<Metric> {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn test_sync_store_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("metrics.json");

    {
        let store = Arc::new(FileStore::new(&path, FlushMode::Sync));
        let service = UpdateService::new(store);
        service.update(&MetricRequest::counter("hits", 1)).unwrap();
        service.update(&MetricRequest::counter("hits", 2)).unwrap();
        service.update(&MetricRequest::gauge("temp", 21.5)).unwrap();
        // Dropped without close: sync mode already persisted every write.
    }

    let reopened = FileStore::new(&path, FlushMode::Sync);
    reopened.restore().unwrap();
    assert_eq!(
        reopened
            .find(&MetricKey::new(MetricKind::Counter, "hits"))
            .unwrap()
            .delta,
        Some(3)
    );
    assert_eq!(
        reopened
            .find(&MetricKey::new(MetricKind::Gauge, "temp"))
            .unwrap()
            .value,
        Some(21.5)
    );
}

#[test]
fn test_interval_store_lags_until_flusher_runs() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("metrics.json");
    let store = Arc::new(FileStore::new(
        &path,
        FlushMode::Interval(Duration::from_millis(50)),
    ));

    let (stop, shutdown) = mpsc::channel();
    let flusher = FileStore::spawn_flusher(&store, shutdown).unwrap().unwrap();

    store.create(&MetricRequest::gauge("temp", 3.0)).unwrap();
    assert!(!path.exists());

    thread::sleep(Duration::from_millis(300));
    assert_eq!(read_snapshot(&path), vec![Metric::gauge("temp", 3.0)]);
    assert!(!store.is_dirty());

    stop.send(()).unwrap();
    flusher.join().unwrap();
}

#[test]
fn test_restore_is_idempotent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("metrics.json");
    fs::write(
        &path,
        r#"[
            { "id": "hits", "type": "counter", "delta": 12 },
            { "id": "temp", "type": "gauge", "value": 21.5 }
        ]"#,
    )
    .unwrap();

    let store = FileStore::new(&path, FlushMode::Sync);
    store.restore().unwrap();
    let first = store.find_all().unwrap();
    store.restore().unwrap();
    let second = store.find_all().unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
    assert!(!store.is_dirty());
}

#[test]
fn test_restart_reproduces_find_all() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("metrics.json");

    let before = {
        let store = FileStore::new(&path, FlushMode::Sync);
        store.create(&MetricRequest::gauge("b", 2.0)).unwrap();
        store.create(&MetricRequest::gauge("a", 1.0)).unwrap();
        store.create(&MetricRequest::counter("z", 5)).unwrap();
        store.find_all().unwrap()
    };

    let restarted = FileStore::new(&path, FlushMode::Sync);
    restarted.restore().unwrap();
    assert_eq!(restarted.find_all().unwrap(), before);
}

#[test]
fn test_rewriting_restored_state_preserves_snapshot() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("metrics.json");

    let original = FileStore::new(&path, FlushMode::Sync);
    original
        .create_or_update_batch(&[
            MetricRequest::gauge("b", 2.0),
            MetricRequest::counter("a", 1),
        ])
        .unwrap();
    let written = read_snapshot(&path);

    let restored = FileStore::new(&path, FlushMode::Sync);
    restored.restore().unwrap();
    restored.update(&MetricRequest::gauge("b", 2.0)).unwrap();

    assert_eq!(read_snapshot(&path), written);
    assert_eq!(written[0].kind, MetricKind::Gauge);
}

#[test]
fn test_close_persists_interval_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("metrics.json");
    let store = FileStore::new(&path, FlushMode::Interval(Duration::from_secs(3600)));

    store.create(&MetricRequest::counter("hits", 7)).unwrap();
    assert!(store.is_dirty());
    store.close().unwrap();

    assert_eq!(read_snapshot(&path), vec![Metric::counter("hits", 7)]);
}
