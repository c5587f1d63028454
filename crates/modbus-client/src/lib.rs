#![allow(dead_code)]

//! Device connection pool: one healthy Modbus handle per canonical wire
//! identity, reused across poll iterations and evicted on observed failure.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_modbus::client::{rtu, tcp, Context};
use tokio_modbus::prelude::{Reader, Slave, SlaveContext, Writer};
use tokio_serial::SerialStream;
use tracing::{debug, info, warn};
use types::{ConnectionParams, Protocol};

const ESTABLISH_ATTEMPTS: usize = 3;
const ESTABLISH_BACKOFF: Duration = Duration::from_secs(2);
const MODBUS_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const TCP_KEEPALIVE_IDLE: Duration = Duration::from_secs(1);

/// Markers the scheduler (and the pool itself) use to decide whether a read
/// failure means the underlying connection, not just the request, is dead.
const CONNECTION_ERROR_MARKERS: [&str; 7] = [
    "port not open",
    "econn",
    "epipe",
    "reset",
    "closed",
    "socket",
    "timeout",
];

/// Case-insensitive match against the connection-error predicate.
pub fn is_connection_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    CONNECTION_ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid socket address {0}:{1}")]
    InvalidAddress(String, u16),
    #[error("failed to establish connection after {attempts} attempts: {source}")]
    Establish {
        attempts: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("modbus error: {0}")]
    Modbus(std::io::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("register address overflow")]
    AddressOverflow,
}

/// Canonical wire identity used as the pool's cache key. Only the fields
/// that affect wire identity participate here; `timeout_ms` deliberately
/// does not, so two devices differing only in per-request timeout share
/// one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionKey {
    Tcp { host: String, port: u16, unit_id: u8 },
    Rtu { serial_port: String, baud_rate: u32, unit_id: u8 },
}

impl ConnectionKey {
    pub fn from_params(params: &ConnectionParams) -> Self {
        match params {
            ConnectionParams::Tcp { host, port, unit_id, .. } => ConnectionKey::Tcp {
                host: host.clone(),
                port: *port,
                unit_id: *unit_id,
            },
            ConnectionParams::Rtu { serial_port, baud_rate, unit_id, .. } => ConnectionKey::Rtu {
                serial_port: serial_port.clone(),
                baud_rate: *baud_rate,
                unit_id: *unit_id,
            },
        }
    }
}

/// A pooled, healthy-until-proven-otherwise Modbus connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    key: ConnectionKey,
    protocol: Protocol,
    context: Mutex<Context>,
    healthy: AtomicBool,
}

impl ConnectionHandle {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// TCP: unhealthy once a socket-level failure has been observed.
    /// RTU: unhealthy once the port has been observed closed.
    /// tokio-modbus hands the transport to the client on attach, so there is
    /// no raw socket left to probe directly; liveness is tracked from the
    /// result of the last request instead (see DESIGN.md).
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    pub async fn read_coils(&self, unit_id: u8, address: u16, count: u16) -> Result<Vec<bool>, PoolError> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(unit_id));
        self.guard(ctx.read_coils(address, count)).await
    }

    pub async fn read_discrete_inputs(&self, unit_id: u8, address: u16, count: u16) -> Result<Vec<bool>, PoolError> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(unit_id));
        self.guard(ctx.read_discrete_inputs(address, count)).await
    }

    pub async fn read_holding_registers(&self, unit_id: u8, address: u16, count: u16) -> Result<Vec<u16>, PoolError> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(unit_id));
        self.guard(ctx.read_holding_registers(address, count)).await
    }

    pub async fn read_input_registers(&self, unit_id: u8, address: u16, count: u16) -> Result<Vec<u16>, PoolError> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(unit_id));
        self.guard(ctx.read_input_registers(address, count)).await
    }

    pub async fn write_single_coil(&self, unit_id: u8, address: u16, value: bool) -> Result<(), PoolError> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(unit_id));
        self.guard(ctx.write_single_coil(address, value)).await
    }

    pub async fn write_single_register(&self, unit_id: u8, address: u16, value: u16) -> Result<(), PoolError> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(unit_id));
        self.guard(ctx.write_single_register(address, value)).await
    }

    pub async fn write_multiple_coils(&self, unit_id: u8, address: u16, values: &[bool]) -> Result<(), PoolError> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(unit_id));
        self.guard(ctx.write_multiple_coils(address, values)).await
    }

    pub async fn write_multiple_registers(&self, unit_id: u8, address: u16, values: &[u16]) -> Result<(), PoolError> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(unit_id));
        self.guard(ctx.write_multiple_registers(address, values)).await
    }

    async fn guard<T>(&self, fut: impl std::future::Future<Output = Result<T, std::io::Error>>) -> Result<T, PoolError> {
        match timeout(MODBUS_TIMEOUT, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                if is_connection_error(&err.to_string()) {
                    self.mark_unhealthy();
                }
                Err(PoolError::Modbus(err))
            }
            Err(_) => {
                self.mark_unhealthy();
                Err(PoolError::Timeout(MODBUS_TIMEOUT))
            }
        }
    }
}

/// Keyed pool of live Modbus connections, one per canonical wire identity.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    entries: Mutex<HashMap<ConnectionKey, Arc<ConnectionHandle>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Returns a healthy handle for `params`, establishing one on a miss or
    /// on a previously evicted/unhealthy entry.
    pub async fn acquire(&self, params: &ConnectionParams) -> Result<Arc<ConnectionHandle>, PoolError> {
        let key = ConnectionKey::from_params(params);

        if let Some(handle) = self.entries.lock().await.get(&key).cloned() {
            if handle.is_healthy() {
                return Ok(handle);
            }
        }

        let (context, protocol) = establish_with_retry(params).await?;
        let handle = Arc::new(ConnectionHandle {
            key: key.clone(),
            protocol,
            context: Mutex::new(context),
            healthy: AtomicBool::new(true),
        });
        self.entries.lock().await.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Drops a handle from the pool so the next `acquire` re-establishes it.
    pub async fn evict(&self, key: &ConnectionKey) {
        if self.entries.lock().await.remove(key).is_some() {
            debug!(?key, "evicted connection from pool");
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

async fn establish_with_retry(params: &ConnectionParams) -> Result<(Context, Protocol), PoolError> {
    let protocol = params.protocol();
    let mut last_err = None;

    for attempt in 1..=ESTABLISH_ATTEMPTS {
        match establish_once(params).await {
            Ok(ctx) => {
                info!(attempt, ?protocol, "established modbus connection");
                return Ok((ctx, protocol));
            }
            Err(err) => {
                warn!(attempt, error = %err, "failed to establish modbus connection");
                if matches!(params, ConnectionParams::Tcp { .. }) {
                    probe_tcp_reachability(params).await;
                }
                last_err = Some(err);
                if attempt < ESTABLISH_ATTEMPTS {
                    sleep(ESTABLISH_BACKOFF).await;
                }
            }
        }
    }

    Err(PoolError::Establish {
        attempts: ESTABLISH_ATTEMPTS,
        source: last_err.expect("loop runs at least once"),
    })
}

async fn establish_once(params: &ConnectionParams) -> Result<Context, std::io::Error> {
    match params {
        ConnectionParams::Tcp { host, port, unit_id, .. } => establish_tcp(host, *port, *unit_id).await,
        ConnectionParams::Rtu { serial_port, baud_rate, unit_id, .. } => {
            establish_rtu(serial_port, *baud_rate, *unit_id)
        }
    }
}

async fn establish_tcp(host: &str, port: u16, unit_id: u8) -> Result<Context, std::io::Error> {
    let addr = resolve_tcp_addr(host, port)?;
    let stream = TcpStream::connect(addr).await?;
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE_IDLE);
    SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
    Ok(tcp::attach_slave(stream, Slave(unit_id)))
}

fn establish_rtu(serial_port: &str, baud_rate: u32, unit_id: u8) -> Result<Context, std::io::Error> {
    let builder = tokio_serial::new(serial_port, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One);
    let port = SerialStream::open(&builder).map_err(std::io::Error::from)?;
    Ok(rtu::attach_slave(port, Slave(unit_id)))
}

fn resolve_tcp_addr(host: &str, port: u16) -> Result<SocketAddr, std::io::Error> {
    format!("{host}:{port}")
        .parse::<SocketAddr>()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid address {host}:{port}")))
}

async fn probe_tcp_reachability(params: &ConnectionParams) {
    let ConnectionParams::Tcp { host, port, .. } = params else { return };
    let target = format!("{host}:{port}");
    match timeout(TCP_PROBE_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(_)) => info!(%target, "tcp reachability probe succeeded"),
        Ok(Err(err)) => warn!(%target, error = %err, "tcp reachability probe failed"),
        Err(_) => warn!(%target, "tcp reachability probe timed out"),
    }
}

/// Inserts an inferred `protocol` field into a raw connection-params JSON
/// value when the caller omitted it: `deviceIp`/`ip` implies `tcp`,
/// `serialPort` implies `rtu`. Used at the config/command deserialization
/// boundary before the value is parsed into a typed [`ConnectionParams`].
pub fn infer_protocol(mut value: serde_json::Value) -> Result<serde_json::Value, PoolError> {
    if let Some(obj) = value.as_object_mut() {
        if !obj.contains_key("protocol") {
            if obj.contains_key("deviceIp") || obj.contains_key("ip") || obj.contains_key("host") {
                obj.insert("protocol".to_string(), serde_json::Value::String("tcp".to_string()));
            } else if obj.contains_key("serialPort") || obj.contains_key("serial_port") {
                obj.insert("protocol".to_string(), serde_json::Value::String("rtu".to_string()));
            } else {
                return Err(PoolError::InvalidAddress(String::new(), 0));
            }
        }
    }
    Ok(value)
}

/// Walks a raw `PollingConfig` JSON value and runs [`infer_protocol`] over
/// each device's `connection` object before the caller hands the value to
/// serde's tagged-enum deserialization, which otherwise requires the
/// `protocol` key to already be present.
pub fn infer_protocols_in_polling_config(mut value: serde_json::Value) -> Result<serde_json::Value, PoolError> {
    if let Some(devices) = value.get_mut("devices").and_then(|d| d.as_array_mut()) {
        for device in devices.iter_mut() {
            if let Some(connection) = device.as_object_mut().and_then(|d| d.remove("connection")) {
                let inferred = infer_protocol(connection)?;
                device.as_object_mut().expect("device is an object").insert("connection".to_string(), inferred);
            }
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_params(host: &str, port: u16, unit_id: u8, timeout_ms: Option<u64>) -> ConnectionParams {
        ConnectionParams::Tcp { host: host.to_string(), port, unit_id, timeout_ms }
    }

    #[test]
    fn connection_error_predicate_matches_case_insensitively() {
        assert!(is_connection_error("Port Not Open (OS Error 2)"));
        assert!(is_connection_error("ECONNRESET"));
        assert!(is_connection_error("connection RESET by peer"));
        assert!(!is_connection_error("invalid function code"));
    }

    #[test]
    fn cache_key_ignores_timeout_ms() {
        let a = tcp_params("10.0.0.5", 502, 1, Some(1_000));
        let b = tcp_params("10.0.0.5", 502, 1, Some(5_000));
        assert_eq!(ConnectionKey::from_params(&a), ConnectionKey::from_params(&b));
    }

    #[test]
    fn cache_key_distinguishes_unit_id() {
        let a = tcp_params("10.0.0.5", 502, 1, None);
        let b = tcp_params("10.0.0.5", 502, 2, None);
        assert_ne!(ConnectionKey::from_params(&a), ConnectionKey::from_params(&b));
    }

    #[test]
    fn infer_protocol_adds_tcp_from_device_ip() {
        let value = serde_json::json!({"deviceIp": "10.0.0.5", "port": 502});
        let inferred = infer_protocol(value).unwrap();
        assert_eq!(inferred["protocol"], "tcp");
    }

    #[test]
    fn infer_protocol_adds_rtu_from_serial_port() {
        let value = serde_json::json!({"serialPort": "/dev/ttyUSB0"});
        let inferred = infer_protocol(value).unwrap();
        assert_eq!(inferred["protocol"], "rtu");
    }

    #[test]
    fn infer_protocol_fails_without_any_hint() {
        let value = serde_json::json!({"unitId": 1});
        assert!(infer_protocol(value).is_err());
    }

    #[tokio::test]
    async fn acquire_reuses_handle_for_same_key() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let _ = stream;
                    std::future::pending::<()>().await;
                });
            }
        });

        let pool = ConnectionPool::new();
        let params = tcp_params(&addr.ip().to_string(), addr.port(), 1, None);
        let first = pool.acquire(&params).await.unwrap();
        let second = pool.acquire(&params).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn evict_forces_reestablish() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let _ = stream;
                    std::future::pending::<()>().await;
                });
            }
        });

        let pool = ConnectionPool::new();
        let params = tcp_params(&addr.ip().to_string(), addr.port(), 1, None);
        let first = pool.acquire(&params).await.unwrap();
        pool.evict(first.key()).await;
        assert_eq!(pool.len().await, 0);
        let second = pool.acquire(&params).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
