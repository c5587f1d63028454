use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use buffer::OfflineBuffer;
use types::Sample;

#[tokio::test]
async fn offline_buffer_add_drain_clear() {
    let path = temp_db_path("offline_buffer_add_drain_clear");
    let store = OfflineBuffer::new(path.to_str().expect("path")).await.expect("init");

    store
        .add_data_points(&[
            Sample::good("dev-a", "reg-1", 10, "2026-01-01T00:00:00.000Z"),
            Sample::good("dev-b", "reg-2", 20, "2026-01-01T00:00:01.000Z"),
        ])
        .await
        .expect("add");

    let count = store.record_count().await.expect("count");
    assert_eq!(count, 2);

    let data = store.buffered_data().await.expect("buffered_data");
    assert_eq!(data.len(), 2);
    assert_eq!(data[0].device_id, "dev-a");
    assert_eq!(data[1].device_id, "dev-b");

    store.clear().await.expect("clear");
    let remaining = store.record_count().await.expect("count");
    assert_eq!(remaining, 0);

    drop(store);
    cleanup_db(&path);
}

#[tokio::test]
async fn offline_buffer_clear_empty_is_noop() {
    let path = temp_db_path("offline_buffer_clear_empty_is_noop");
    let store = OfflineBuffer::new(path.to_str().expect("path")).await.expect("init");

    let count = store.record_count().await.expect("count");
    assert_eq!(count, 0);

    store.clear().await.expect("clear");

    let count = store.record_count().await.expect("count");
    assert_eq!(count, 0);

    drop(store);
    cleanup_db(&path);
}

fn temp_db_path(prefix: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    path.push(format!("{prefix}-{pid}-{ts}.sqlite"));
    path
}

fn cleanup_db(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
    let wal = PathBuf::from(format!("{}-wal", path.display()));
    let shm = PathBuf::from(format!("{}-shm", path.display()));
    let _ = std::fs::remove_file(wal);
    let _ = std::fs::remove_file(shm);
}
