#![allow(dead_code)]

//! The four buffers the scheduler and cloud channel share: an in-memory
//! report-by-exception cache, two in-memory queues, and a disk-backed spill
//! queue for when the control channel is down.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};
use types::Sample;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// `(deviceId, registerId) -> lastValue`. Absent entries count as changed.
#[derive(Debug, Default)]
pub struct ValueCache {
    values: Mutex<HashMap<(String, String), u16>>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call changed the cached value (including the
    /// first observation of a key).
    pub fn update(&self, device_id: &str, register_id: &str, value: u16) -> bool {
        let key = (device_id.to_string(), register_id.to_string());
        let mut values = self.values.lock().expect("value cache mutex poisoned");
        match values.insert(key, value) {
            Some(prev) => prev != value,
            None => true,
        }
    }

    pub fn snapshot(&self) -> Vec<(String, String, u16)> {
        self.values
            .lock()
            .expect("value cache mutex poisoned")
            .iter()
            .map(|((device_id, register_id), value)| (device_id.clone(), register_id.clone(), *value))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.lock().expect("value cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered queue of changed samples, plus the full-refresh timer.
#[derive(Debug)]
pub struct TransmitBuffer {
    queue: Mutex<VecDeque<Sample>>,
    last_full_refresh: Mutex<Instant>,
    full_refresh_interval: Mutex<Duration>,
}

impl TransmitBuffer {
    pub fn new(full_refresh_interval_ms: u64) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            last_full_refresh: Mutex::new(Instant::now()),
            full_refresh_interval: Mutex::new(Duration::from_millis(full_refresh_interval_ms)),
        }
    }

    pub fn enqueue(&self, sample: Sample) {
        self.queue.lock().expect("transmit buffer mutex poisoned").push_back(sample);
    }

    pub fn should_send_full_refresh(&self) -> bool {
        let interval = *self.full_refresh_interval.lock().expect("transmit buffer mutex poisoned");
        self.last_full_refresh.lock().expect("transmit buffer mutex poisoned").elapsed() >= interval
    }

    pub fn reset_full_refresh_timer(&self) {
        *self.last_full_refresh.lock().expect("transmit buffer mutex poisoned") = Instant::now();
    }

    pub fn set_full_refresh_interval_ms(&self, interval_ms: u64) {
        *self.full_refresh_interval.lock().expect("transmit buffer mutex poisoned") = Duration::from_millis(interval_ms);
    }

    /// Drains the queue, preserving enqueue order.
    pub fn drain(&self) -> Vec<Sample> {
        std::mem::take(&mut *self.queue.lock().expect("transmit buffer mutex poisoned")).into()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().expect("transmit buffer mutex poisoned").is_empty()
    }
}

/// Bounded FIFO of every sample observed, not just changes.
#[derive(Debug)]
pub struct HistoricalBuffer {
    cap: usize,
    samples: Mutex<VecDeque<Sample>>,
    overflowed: AtomicBool,
}

impl HistoricalBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            samples: Mutex::new(VecDeque::new()),
            overflowed: AtomicBool::new(false),
        }
    }

    pub fn append(&self, sample: Sample) {
        let mut samples = self.samples.lock().expect("historical buffer mutex poisoned");
        samples.push_back(sample);
        if samples.len() > self.cap {
            let excess = samples.len() - self.cap;
            samples.drain(0..excess);
            if !self.overflowed.swap(true, Ordering::Relaxed) {
                warn!(cap = self.cap, "historical buffer overflowed, truncated to newest entries");
            }
        }
    }

    /// Snapshots and clears the buffer, preserving FIFO order.
    pub fn drain(&self) -> Vec<Sample> {
        self.overflowed.store(false, Ordering::Relaxed);
        std::mem::take(&mut *self.samples.lock().expect("historical buffer mutex poisoned")).into()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().expect("historical buffer mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Disk-backed spill queue, used while the control channel is down.
/// Soft-capped by on-disk file size; toggled between buffering and
/// not-buffering by the control channel.
#[derive(Debug, Clone)]
pub struct OfflineBuffer {
    pool: SqlitePool,
    path: String,
    max_size_bytes: u64,
    buffering: std::sync::Arc<AtomicBool>,
}

const DEFAULT_MAX_SIZE_BYTES: u64 = 50 * 1024 * 1024;

impl OfflineBuffer {
    pub async fn new(path: &str) -> Result<Self, BufferError> {
        Self::with_capacity(path, DEFAULT_MAX_SIZE_BYTES).await
    }

    pub async fn with_capacity(path: &str, max_size_bytes: u64) -> Result<Self, BufferError> {
        let options = SqliteConnectOptions::from_str(&sqlite_url(path))?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;

        sqlx::query("PRAGMA journal_mode = WAL;").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL;").execute(&pool).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS offline_samples (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                payload BLOB NOT NULL,\
                created_at INTEGER NOT NULL\
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_offline_created_at ON offline_samples(created_at)")
            .execute(&pool)
            .await?;

        info!(path = %path, "offline buffer initialized");

        Ok(Self {
            pool,
            path: path.to_string(),
            max_size_bytes,
            buffering: std::sync::Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn set_buffering(&self, enabled: bool) {
        self.buffering.store(enabled, Ordering::Relaxed);
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::Relaxed)
    }

    /// No-op while buffering is disabled (additions are silently ignored).
    pub async fn add_data_points(&self, samples: &[Sample]) -> Result<(), BufferError> {
        if !self.is_buffering() || samples.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for sample in samples {
            let payload = serde_json::to_vec(sample)?;
            sqlx::query("INSERT INTO offline_samples (payload, created_at) VALUES (?, ?)")
                .bind(payload)
                .bind(unix_ms())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn buffered_data(&self) -> Result<Vec<Sample>, BufferError> {
        let rows = sqlx::query("SELECT payload FROM offline_samples ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let payload: Vec<u8> = row.get("payload");
                serde_json::from_slice(&payload).map_err(BufferError::from)
            })
            .collect()
    }

    pub async fn clear(&self) -> Result<(), BufferError> {
        sqlx::query("DELETE FROM offline_samples").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn record_count(&self) -> Result<i64, BufferError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM offline_samples")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count"))
    }

    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_over_capacity(&self) -> bool {
        self.size_bytes() >= self.max_size_bytes
    }
}

fn sqlite_url(path: &str) -> String {
    if path.starts_with("sqlite:") {
        path.to_string()
    } else {
        format!("sqlite://{path}")
    }
}

fn unix_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::Quality;

    fn temp_db_path(name: &str) -> String {
        let pid = std::process::id();
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("{}/buffer-test-{name}-{pid}-{nanos}.sqlite", std::env::temp_dir().display())
    }

    fn cleanup_db(path: &str) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(format!("{path}-wal"));
        let _ = std::fs::remove_file(format!("{path}-shm"));
    }

    #[test]
    fn value_cache_reports_first_observation_as_changed() {
        let cache = ValueCache::new();
        assert!(cache.update("dev-1", "reg-1", 42));
    }

    #[test]
    fn value_cache_reports_unchanged_repeat() {
        let cache = ValueCache::new();
        cache.update("dev-1", "reg-1", 42);
        assert!(!cache.update("dev-1", "reg-1", 42));
        assert!(cache.update("dev-1", "reg-1", 43));
    }

    #[test]
    fn historical_buffer_truncates_to_newest_cap_entries() {
        let buffer = HistoricalBuffer::new(2);
        for i in 0..5u16 {
            buffer.append(Sample::good("dev-1", "reg-1", i, "2026-01-01T00:00:00.000Z"));
        }
        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].value, Some(3));
        assert_eq!(drained[1].value, Some(4));
    }

    #[test]
    fn transmit_buffer_drains_in_enqueue_order() {
        let buffer = TransmitBuffer::new(300_000);
        buffer.enqueue(Sample::good("dev-1", "reg-1", 1, "t"));
        buffer.enqueue(Sample::good("dev-1", "reg-2", 2, "t"));
        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].register_id, "reg-1");
        assert!(buffer.is_empty());
    }

    #[test]
    fn transmit_buffer_full_refresh_due_immediately_after_short_interval() {
        let buffer = TransmitBuffer::new(0);
        assert!(buffer.should_send_full_refresh());
        buffer.reset_full_refresh_timer();
        assert!(buffer.should_send_full_refresh());
    }

    #[tokio::test]
    async fn offline_buffer_round_trips_samples() {
        let path = temp_db_path("roundtrip");
        let buffer = OfflineBuffer::new(&path).await.unwrap();

        let samples = vec![
            Sample::good("dev-1", "reg-1", 10, "2026-01-01T00:00:00.000Z"),
            Sample::bad("dev-1", "reg-2", "2026-01-01T00:00:00.000Z"),
        ];
        buffer.add_data_points(&samples).await.unwrap();

        let stored = buffer.buffered_data().await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].value, Some(10));
        assert_eq!(stored[1].quality, Quality::Bad);
        assert_eq!(buffer.record_count().await.unwrap(), 2);

        buffer.clear().await.unwrap();
        assert_eq!(buffer.record_count().await.unwrap(), 0);

        cleanup_db(&path);
    }

    #[tokio::test]
    async fn offline_buffer_ignores_additions_while_not_buffering() {
        let path = temp_db_path("toggle");
        let buffer = OfflineBuffer::new(&path).await.unwrap();
        buffer.set_buffering(false);

        buffer
            .add_data_points(&[Sample::good("dev-1", "reg-1", 1, "t")])
            .await
            .unwrap();
        assert_eq!(buffer.record_count().await.unwrap(), 0);

        cleanup_db(&path);
    }
}
