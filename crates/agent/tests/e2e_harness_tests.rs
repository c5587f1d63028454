use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use buffer::{HistoricalBuffer, OfflineBuffer, TransmitBuffer, ValueCache};
use modbus_client::ConnectionPool;
use poller_actor::{PollerHandles, PollingScheduler};
use types::{ConnectionParams, Device, PollGroup, PollingConfig, Quality, Register};

/// Exercises the full local pipeline end to end, without any network
/// dependency: an unreachable device is scheduled, its failed poll
/// iterations land in the Historical Buffer, and the offline spillover
/// path persists them to disk the way the Bulk Uploader would on a closed
/// control channel.
#[tokio::test]
async fn unreachable_device_poll_spills_to_offline_buffer() {
    let path = temp_db_path("e2e_harness");
    let offline = OfflineBuffer::new(path.to_str().expect("path")).await.expect("offline buffer init");

    let handles = PollerHandles {
        pool: Arc::new(ConnectionPool::new()),
        value_cache: Arc::new(ValueCache::new()),
        transmit: Arc::new(TransmitBuffer::new(300_000)),
        historical: Arc::new(HistoricalBuffer::new(1_000)),
    };
    let scheduler = PollingScheduler::new(handles.clone());

    let config = PollingConfig {
        config_id: "cfg-e2e".to_string(),
        config_name: None,
        full_refresh_interval_ms: 300_000,
        batch_window_ms: 2_000,
        historical_batch_interval_ms: 60_000,
        devices: vec![Device {
            device_id: "dev-e2e".to_string(),
            connection: ConnectionParams::Tcp { host: "127.0.0.1".to_string(), port: 1, unit_id: 1, timeout_ms: None },
            groups: vec![PollGroup {
                group_id: "g1".to_string(),
                interval_ms: 50,
                registers: vec![Register { register_id: "r1".to_string(), address: 40001, function_code: None }],
            }],
        }],
    };

    scheduler.apply(&config);
    tokio::time::sleep(Duration::from_secs(7)).await;
    scheduler.stop_all();

    let failed = handles.historical.drain();
    assert!(!failed.is_empty());
    assert!(failed.iter().all(|sample| sample.quality == Quality::Bad));

    offline.add_data_points(&failed).await.expect("spill to offline buffer");
    assert_eq!(offline.record_count().await.expect("count"), failed.len() as i64);

    let persisted = offline.buffered_data().await.expect("read back");
    assert_eq!(persisted.len(), failed.len());
    assert_eq!(persisted[0].device_id, "dev-e2e");

    offline.clear().await.expect("clear");
    assert_eq!(offline.record_count().await.expect("count"), 0);

    cleanup_db(&path);
}

fn temp_db_path(prefix: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let pid = std::process::id();
    let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    path.push(format!("{prefix}-{pid}-{ts}.sqlite"));
    path
}

fn cleanup_db(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(format!("{}-wal", path.display()));
    let _ = std::fs::remove_file(format!("{}-shm", path.display()));
}
