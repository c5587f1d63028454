#![allow(dead_code)]

//! Per-group polling scheduler: one independent periodic timer per
//! `(device, group)`, re-entrancy guarded, reconfigured atomically.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use buffer::{HistoricalBuffer, TransmitBuffer, ValueCache};
use modbus_client::{is_connection_error, ConnectionHandle, ConnectionPool, PoolError};
use optimizer::{optimize, ReadCommand, DEFAULT_MAX_BLOCK_SIZE};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, warn};
use types::{iteration_timestamp, Device, PollGroup, PollingConfig, Sample};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("group interval must be at least 1ms")]
    InvalidInterval,
}

/// Shared state every poll iteration reads and writes.
#[derive(Clone)]
pub struct PollerHandles {
    pub pool: Arc<ConnectionPool>,
    pub value_cache: Arc<ValueCache>,
    pub transmit: Arc<TransmitBuffer>,
    pub historical: Arc<HistoricalBuffer>,
}

/// Owns one periodic timer per `(device, group)`. `apply` tears down every
/// prior timer before arming the new set, so reconfiguration is atomic with
/// respect to observers.
pub struct PollingScheduler {
    handles: PollerHandles,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl PollingScheduler {
    pub fn new(handles: PollerHandles) -> Self {
        Self { handles, tasks: StdMutex::new(Vec::new()) }
    }

    /// Stops every timer from the previous configuration and starts one
    /// timer per `(device, group)` in the new one. Idempotent: calling with
    /// the same config again simply restarts identical timers.
    pub fn apply(&self, config: &PollingConfig) {
        self.stop_all();

        let mut tasks = self.tasks.lock().expect("scheduler task list poisoned");
        for device in &config.devices {
            for group in &device.groups {
                tasks.push(self.spawn_group(device.clone(), group.clone()));
            }
        }
    }

    /// Cancels every running group timer. Safe to call when nothing is running.
    pub fn stop_all(&self) {
        let mut tasks = self.tasks.lock().expect("scheduler task list poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    pub fn active_group_count(&self) -> usize {
        self.tasks.lock().expect("scheduler task list poisoned").len()
    }

    fn spawn_group(&self, device: Device, group: PollGroup) -> JoinHandle<()> {
        let handles = self.handles.clone();
        let interval_ms = group.interval_ms.max(1);
        let guard = Arc::new(AsyncMutex::new(()));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;

                let Ok(permit) = Arc::clone(&guard).try_lock_owned() else {
                    warn!(
                        device_id = %device.device_id,
                        group_id = %group.group_id,
                        "previous iteration still running, skipping tick"
                    );
                    continue;
                };

                let handles = handles.clone();
                let device = device.clone();
                let group = group.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    run_iteration(&handles, &device, &group).await;
                });
            }
        })
    }
}

/// Runs one poll iteration for one `(device, group)`. Never panics or
/// propagates an error; every failure path is logged and recorded as bad
/// historical samples instead.
async fn run_iteration(handles: &PollerHandles, device: &Device, group: &PollGroup) {
    let handle = match handles.pool.acquire(&device.connection).await {
        Ok(handle) => handle,
        Err(err) => {
            warn!(device_id = %device.device_id, group_id = %group.group_id, error = %err, "failed to acquire connection");
            record_bad_group(handles, device, group);
            metrics::counter!("poller_acquire_errors_total").increment(1);
            return;
        }
    };

    let commands = match optimize(&group.registers, DEFAULT_MAX_BLOCK_SIZE) {
        Ok(commands) => commands,
        Err(err) => {
            error!(device_id = %device.device_id, group_id = %group.group_id, error = %err, "failed to plan read commands");
            record_bad_group(handles, device, group);
            return;
        }
    };

    let timestamp = iteration_timestamp();
    let unit_id = device.connection.unit_id();

    for command in &commands {
        run_command(handles, device, &handle, unit_id, command, &timestamp).await;
    }

    metrics::counter!("poller_iterations_total").increment(1);
}

async fn run_command(
    handles: &PollerHandles,
    device: &Device,
    handle: &Arc<ConnectionHandle>,
    unit_id: u8,
    command: &ReadCommand,
    timestamp: &str,
) {
    let active_handle = if handle.is_healthy() {
        Arc::clone(handle)
    } else {
        handles.pool.evict(handle.key()).await;
        match handles.pool.acquire(&device.connection).await {
            Ok(fresh) => fresh,
            Err(err) => {
                warn!(device_id = %device.device_id, error = %err, "failed to re-acquire unhealthy connection");
                record_bad_command(handles, device, command, timestamp);
                return;
            }
        }
    };

    match active_handle.read_holding_registers(unit_id, command.start_address, command.count).await {
        Ok(values) => record_good_command(handles, device, command, &values, timestamp),
        Err(err) => handle_read_failure(handles, device, &active_handle, unit_id, command, timestamp, err).await,
    }
}

async fn handle_read_failure(
    handles: &PollerHandles,
    device: &Device,
    handle: &Arc<ConnectionHandle>,
    unit_id: u8,
    command: &ReadCommand,
    timestamp: &str,
    err: PoolError,
) {
    metrics::counter!("poller_read_errors_total").increment(1);

    if !is_connection_error(&err.to_string()) {
        warn!(device_id = %device.device_id, error = %err, "modbus read failed");
        record_bad_command(handles, device, command, timestamp);
        return;
    }

    warn!(device_id = %device.device_id, error = %err, "connection error, evicting and retrying once");
    handles.pool.evict(handle.key()).await;

    let retried = match handles.pool.acquire(&device.connection).await {
        Ok(fresh) => fresh,
        Err(err) => {
            warn!(device_id = %device.device_id, error = %err, "re-acquire after eviction failed");
            record_bad_command(handles, device, command, timestamp);
            return;
        }
    };

    match retried.read_holding_registers(unit_id, command.start_address, command.count).await {
        Ok(values) => record_good_command(handles, device, command, &values, timestamp),
        Err(err) => {
            warn!(device_id = %device.device_id, error = %err, "retry after eviction failed");
            record_bad_command(handles, device, command, timestamp);
        }
    }
}

fn record_good_command(handles: &PollerHandles, device: &Device, command: &ReadCommand, values: &[u16], timestamp: &str) {
    for (register, value) in command.registers.iter().zip(values.iter()) {
        let changed = handles.value_cache.update(&device.device_id, &register.register_id, *value);
        let sample = Sample::good(&device.device_id, &register.register_id, *value, timestamp);
        handles.historical.append(sample.clone());
        if changed || handles.transmit.should_send_full_refresh() {
            handles.transmit.enqueue(sample);
        }
    }
}

fn record_bad_command(handles: &PollerHandles, device: &Device, command: &ReadCommand, timestamp: &str) {
    for register in &command.registers {
        handles.historical.append(Sample::bad(&device.device_id, &register.register_id, timestamp));
    }
}

fn record_bad_group(handles: &PollerHandles, device: &Device, group: &PollGroup) {
    let timestamp = iteration_timestamp();
    let mut sorted: Vec<&types::Register> = group.registers.iter().collect();
    sorted.sort_by_key(|r| r.address);
    for register in sorted {
        handles.historical.append(Sample::bad(&device.device_id, &register.register_id, &timestamp));
    }
}
