#![allow(dead_code)]

//! Cloud control channel: WebSocket connection lifecycle, the HTTP-side
//! config watcher, bulk uploader, batch transmitter, and status reporter
//! tasks that run alongside it.

pub mod frames;
pub mod http;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use buffer::{HistoricalBuffer, OfflineBuffer, TransmitBuffer, ValueCache};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use modbus_client::ConnectionPool;
use poller_actor::{PollerHandles, PollingScheduler};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use types::{iteration_timestamp, Device, PollingConfig};

use crate::frames::{
    BufferingStatus, CommandErrorFrame, CommandResultFrame, DataUpdateFrame, HeartbeatFrame, InboundCommand,
    StatusPatch, UpdateItem, WelcomeFrame,
};
use crate::http::{CloudEndpoints, CloudHttpClient, HttpError};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const JWT_PROACTIVE_REFRESH: Duration = Duration::from_secs(55 * 60);
const JWT_EXPIRY_SOON: Duration = Duration::from_secs(5 * 60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(120);
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);
const OFFLINE_DRAIN_CHUNK: usize = 1000;
const KNOWN_COMMANDS: [&str; 5] =
    ["set_polling_config", "network_scan", "modbus_read", "modbus_write", "test_communication"];

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("no jwt available to open the control channel")]
    MissingToken,
    #[error("control channel is not open")]
    NotOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Authenticating,
    Connecting,
    Open,
    Closing,
}

/// Dispatches inbound WebSocket commands. Implemented by [`DefaultCommandHandler`];
/// kept as a trait so the channel doesn't need a hard dependency on how commands
/// are actually carried out.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: InboundCommand) -> Result<serde_json::Value, String>;
}

struct TokenState {
    jwt: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// Owns the WebSocket lifecycle: authenticate, connect, stay open, reconnect
/// on close. State is exposed via a `watch` channel so the periodic tasks
/// (config watcher, uploader, transmitter, status reporter) can react to
/// open/closed transitions without polling it.
pub struct ControlChannel {
    http: CloudHttpClient,
    registration_token: String,
    agent_id: StdMutex<Option<String>>,
    token: StdMutex<Option<TokenState>>,
    state_tx: watch::Sender<ChannelState>,
    outbound: StdMutex<Option<mpsc::UnboundedSender<Message>>>,
    offline: Arc<OfflineBuffer>,
    handler: Arc<dyn CommandHandler>,
}

impl ControlChannel {
    pub fn new(
        http: CloudHttpClient,
        registration_token: String,
        offline: Arc<OfflineBuffer>,
        handler: Arc<dyn CommandHandler>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        Arc::new(Self {
            http,
            registration_token,
            agent_id: StdMutex::new(None),
            token: StdMutex::new(None),
            state_tx,
            outbound: StdMutex::new(None),
            offline,
            handler,
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn agent_id(&self) -> Option<String> {
        self.agent_id.lock().expect("agent id lock poisoned").clone()
    }

    pub fn jwt(&self) -> Option<String> {
        self.token.lock().expect("token lock poisoned").as_ref().map(|t| t.jwt.clone())
    }

    fn set_state(&self, state: ChannelState) {
        let _ = self.state_tx.send(state);
    }

    /// Drives the connect / authenticate / run / reconnect loop forever.
    /// Intended to be spawned once and left running for the process lifetime.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.set_state(ChannelState::Authenticating);
            if let Err(err) = self.authenticate().await {
                warn!(error = %err, "control channel authentication failed");
                self.enter_disconnected();
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }

            self.set_state(ChannelState::Connecting);
            if let Err(err) = Arc::clone(&self).open_and_run().await {
                warn!(error = %err, "control channel closed");
            }

            self.enter_disconnected();
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    fn enter_disconnected(&self) {
        *self.outbound.lock().expect("outbound lock poisoned") = None;
        self.offline.set_buffering(true);
        self.set_state(ChannelState::Disconnected);
    }

    async fn authenticate(&self) -> Result<(), HttpError> {
        let response = self.http.authenticate(&self.registration_token).await?;
        let expires_at = jwt_expiry(&response.jwt).unwrap_or_else(|| {
            chrono::Utc::now() + chrono::Duration::seconds(response.expires_in as i64)
        });
        *self.token.lock().expect("token lock poisoned") = Some(TokenState { jwt: response.jwt, expires_at });
        Ok(())
    }

    fn token_expiring_soon(&self) -> bool {
        match self.token.lock().expect("token lock poisoned").as_ref() {
            Some(state) => state.expires_at - chrono::Utc::now() < chrono::Duration::from_std(JWT_EXPIRY_SOON).unwrap(),
            None => true,
        }
    }

    /// Sends a frame while the channel is open. Returns `NotOpen` if the
    /// socket isn't connected right now; callers decide whether that's a
    /// reason to spill to the offline buffer.
    pub fn send_json<T: Serialize>(&self, frame: &T) -> Result<(), ChannelError> {
        let text = serde_json::to_string(frame).map_err(|_| ChannelError::NotOpen)?;
        let sender = self.outbound.lock().expect("outbound lock poisoned").clone();
        match sender {
            Some(sender) => sender.send(Message::Text(text)).map_err(|_| ChannelError::NotOpen),
            None => Err(ChannelError::NotOpen),
        }
    }

    async fn open_and_run(self: Arc<Self>) -> Result<(), ChannelError> {
        if self.jwt().is_none() || self.token_expiring_soon() {
            self.authenticate().await?;
        }
        let jwt = self.jwt().ok_or(ChannelError::MissingToken)?;
        let url = self.http.websocket_url(&jwt);

        let (ws_stream, _response) = connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock().expect("outbound lock poisoned") = Some(tx);

        self.set_state(ChannelState::Open);
        self.offline.set_buffering(false);
        info!("control channel open");

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut jwt_refresh = tokio::time::interval(JWT_PROACTIVE_REFRESH);
        heartbeat.tick().await;
        jwt_refresh.tick().await;

        loop {
            tokio::select! {
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.handle_inbound(&text).await,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "control channel read error");
                            break;
                        }
                    }
                }
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(message) => {
                            if write.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    let frame = serde_json::to_string(&HeartbeatFrame::default()).expect("heartbeat frame serializes");
                    if write.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                _ = jwt_refresh.tick() => {
                    if self.authenticate().await.is_ok() {
                        info!("jwt refreshed proactively, reopening control channel");
                        break;
                    }
                }
            }
        }

        self.set_state(ChannelState::Closing);
        *self.outbound.lock().expect("outbound lock poisoned") = None;
        let _ = write.close().await;
        Ok(())
    }

    async fn handle_inbound(&self, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "received malformed control frame");
                return;
            }
        };

        if value.get("type").and_then(|v| v.as_str()) == Some("connected") {
            match serde_json::from_value::<WelcomeFrame>(value) {
                Ok(welcome) => *self.agent_id.lock().expect("agent id lock poisoned") = Some(welcome.agent_id),
                Err(err) => warn!(error = %err, "malformed welcome frame"),
            }
            return;
        }

        let command: InboundCommand = match serde_json::from_value(value) {
            Ok(command) => command,
            Err(err) => {
                warn!(error = %err, "unrecognized control frame");
                return;
            }
        };

        if command.command == "heartbeat_ack" {
            return;
        }

        if !KNOWN_COMMANDS.contains(&command.command.as_str()) {
            warn!(command = %command.command, "unknown command, ignoring");
            return;
        }

        let command_id = command.command_id.clone();
        match self.handler.handle(command).await {
            Ok(payload) => {
                let frame = CommandResultFrame { command_id, kind: "command_result".to_string(), payload };
                let _ = self.send_json(&frame);
            }
            Err(error) => {
                let frame = CommandErrorFrame::new(command_id, error);
                let _ = self.send_json(&frame);
            }
        }
    }
}

fn jwt_expiry(jwt: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    #[derive(Deserialize)]
    struct Claims {
        exp: i64,
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;

    let decoded = decode::<Claims>(jwt, &DecodingKey::from_secret(&[]), &validation).ok()?;
    chrono::DateTime::from_timestamp(decoded.claims.exp, 0)
}

/// Applies a [`PollingConfig`] to the scheduler and the transmit buffer's
/// full-refresh cadence, and remembers the currently-applied config so
/// inbound commands can resolve a device by id.
pub struct ConfigApplier {
    scheduler: Arc<PollingScheduler>,
    transmit: Arc<TransmitBuffer>,
    batch_window_ms: Arc<AtomicU64>,
    current: StdMutex<Option<PollingConfig>>,
}

impl ConfigApplier {
    pub fn new(scheduler: Arc<PollingScheduler>, transmit: Arc<TransmitBuffer>, batch_window_ms: Arc<AtomicU64>) -> Self {
        Self { scheduler, transmit, batch_window_ms, current: StdMutex::new(None) }
    }

    pub fn apply(&self, config: PollingConfig) {
        self.transmit.set_full_refresh_interval_ms(config.full_refresh_interval_ms);
        self.batch_window_ms.store(config.batch_window_ms.max(1), Ordering::Relaxed);
        self.scheduler.apply(&config);
        *self.current.lock().expect("config lock poisoned") = Some(config);
    }

    pub fn clear(&self) {
        self.scheduler.stop_all();
        *self.current.lock().expect("config lock poisoned") = None;
    }

    pub fn current_config_id(&self) -> Option<String> {
        self.current.lock().expect("config lock poisoned").as_ref().map(|c| c.config_id.clone())
    }

    pub fn find_device(&self, device_id: &str) -> Option<Device> {
        self.current
            .lock()
            .expect("config lock poisoned")
            .as_ref()
            .and_then(|c| c.devices.iter().find(|d| d.device_id == device_id).cloned())
    }
}

/// Dispatches `set_polling_config`, `modbus_read`, `modbus_write`, and
/// `test_communication` commands against the live connection pool and the
/// currently-applied config.
pub struct DefaultCommandHandler {
    pool: Arc<ConnectionPool>,
    applier: Arc<ConfigApplier>,
}

impl DefaultCommandHandler {
    pub fn new(pool: Arc<ConnectionPool>, applier: Arc<ConfigApplier>) -> Self {
        Self { pool, applier }
    }
}

#[async_trait]
impl CommandHandler for DefaultCommandHandler {
    async fn handle(&self, command: InboundCommand) -> Result<serde_json::Value, String> {
        match command.command.as_str() {
            "set_polling_config" => {
                let payload = modbus_client::infer_protocols_in_polling_config(command.payload).map_err(|e| e.to_string())?;
                let config: PollingConfig = serde_json::from_value(payload).map_err(|e| e.to_string())?;
                self.applier.apply(config);
                Ok(serde_json::json!({ "applied": true }))
            }
            "modbus_read" => {
                #[derive(Deserialize)]
                struct Req {
                    device_id: String,
                    address: u32,
                    count: u16,
                }
                let req: Req = serde_json::from_value(command.payload).map_err(|e| e.to_string())?;
                let device = self.applier.find_device(&req.device_id).ok_or("unknown device")?;
                let handle = self.pool.acquire(&device.connection).await.map_err(|e| e.to_string())?;
                let start = optimizer::normalize_address(req.address).map_err(|e| e.to_string())?;
                let values = handle
                    .read_holding_registers(device.connection.unit_id(), start, req.count)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::json!({ "values": values }))
            }
            "modbus_write" => {
                #[derive(Deserialize)]
                struct Req {
                    device_id: String,
                    address: u32,
                    value: u16,
                }
                let req: Req = serde_json::from_value(command.payload).map_err(|e| e.to_string())?;
                let device = self.applier.find_device(&req.device_id).ok_or("unknown device")?;
                let handle = self.pool.acquire(&device.connection).await.map_err(|e| e.to_string())?;
                let address = optimizer::normalize_address(req.address).map_err(|e| e.to_string())?;
                handle
                    .write_single_register(device.connection.unit_id(), address, req.value)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::json!({ "written": true }))
            }
            "test_communication" => {
                #[derive(Deserialize)]
                struct Req {
                    device_id: String,
                }
                let req: Req = serde_json::from_value(command.payload).map_err(|e| e.to_string())?;
                let device = self.applier.find_device(&req.device_id).ok_or("unknown device")?;
                match self.pool.acquire(&device.connection).await {
                    Ok(_) => Ok(serde_json::json!({ "reachable": true })),
                    Err(err) => Ok(serde_json::json!({ "reachable": false, "error": err.to_string() })),
                }
            }
            "network_scan" => Err("network_scan is not supported: devices are named explicitly by the active polling config".to_string()),
            other => Err(format!("unsupported command: {other}")),
        }
    }
}

/// Polls the active config endpoint every [`CONFIG_POLL_INTERVAL`], and
/// immediately whenever the control channel transitions to `Open`.
pub struct ConfigWatcher {
    http: CloudHttpClient,
    channel: Arc<ControlChannel>,
    applier: Arc<ConfigApplier>,
}

impl ConfigWatcher {
    pub fn new(http: CloudHttpClient, channel: Arc<ControlChannel>, applier: Arc<ConfigApplier>) -> Arc<Self> {
        Arc::new(Self { http, channel, applier })
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CONFIG_POLL_INTERVAL);
            let mut state_rx = self.channel.subscribe();
            loop {
                tokio::select! {
                    _ = interval.tick() => self.check().await,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *state_rx.borrow() == ChannelState::Open {
                            self.check().await;
                        }
                    }
                }
            }
        })
    }

    async fn check(&self) {
        let Some(jwt) = self.channel.jwt() else { return };
        match self.http.fetch_config(&jwt).await {
            Ok(response) => {
                if let Some(payload) = response.config.filter(|_| response.has_config) {
                    if self.applier.current_config_id().as_deref() != Some(payload.id.as_str()) {
                        info!(config_id = %payload.id, "applying new polling config");
                        let mut config = payload.polling_config;
                        config.config_id = payload.id;
                        self.applier.apply(config);
                    }
                } else if self.applier.current_config_id().is_some() {
                    info!("cloud reports no active config, clearing local schedule");
                    self.applier.clear();
                }
            }
            Err(err) => warn!(error = %err, "config fetch failed"),
        }
    }
}

/// Drains the historical buffer into the ingest endpoint on a fixed
/// interval, spilling to the offline buffer on any failure or while the
/// control channel is closed; drains the offline buffer in order on reconnect.
pub struct BulkUploader {
    http: CloudHttpClient,
    channel: Arc<ControlChannel>,
    historical: Arc<HistoricalBuffer>,
    offline: Arc<OfflineBuffer>,
    interval: Duration,
}

impl BulkUploader {
    pub fn new(
        http: CloudHttpClient,
        channel: Arc<ControlChannel>,
        historical: Arc<HistoricalBuffer>,
        offline: Arc<OfflineBuffer>,
        interval_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self { http, channel, historical, offline, interval: Duration::from_millis(interval_ms.max(1)) })
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            let mut state_rx = self.channel.subscribe();
            loop {
                tokio::select! {
                    _ = interval.tick() => self.tick().await,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *state_rx.borrow() == ChannelState::Open {
                            self.drain_offline().await;
                        }
                    }
                }
            }
        })
    }

    async fn tick(&self) {
        let snapshot = self.historical.drain();
        if snapshot.is_empty() {
            return;
        }

        if !self.channel.is_open() {
            let _ = self.offline.add_data_points(&snapshot).await;
            return;
        }

        let Some(agent_id) = self.channel.agent_id() else {
            let _ = self.offline.add_data_points(&snapshot).await;
            return;
        };
        let Some(jwt) = self.channel.jwt() else {
            let _ = self.offline.add_data_points(&snapshot).await;
            return;
        };

        match self.http.ingest(&agent_id, &jwt, snapshot.clone()).await {
            Ok(response) if response.success => {}
            _ => {
                let _ = self.offline.add_data_points(&snapshot).await;
            }
        }
    }

    async fn drain_offline(&self) {
        let (Some(agent_id), Some(jwt)) = (self.channel.agent_id(), self.channel.jwt()) else { return };
        let all = match self.offline.buffered_data().await {
            Ok(samples) => samples,
            Err(err) => {
                warn!(error = %err, "failed to read offline buffer");
                return;
            }
        };
        if all.is_empty() {
            return;
        }

        for chunk in all.chunks(OFFLINE_DRAIN_CHUNK) {
            match self.http.ingest(&agent_id, &jwt, chunk.to_vec()).await {
                Ok(response) if response.success => continue,
                _ => {
                    warn!("offline buffer drain stopped mid-chunk, leaving remainder buffered");
                    return;
                }
            }
        }

        if let Err(err) = self.offline.clear().await {
            warn!(error = %err, "failed to clear offline buffer after drain");
        }
    }
}

/// Sends `data_update` frames while the channel is open: a full Value Cache
/// snapshot on the full-refresh cadence, otherwise an incremental drain of
/// the Transmit Buffer.
pub struct BatchTransmitter {
    channel: Arc<ControlChannel>,
    value_cache: Arc<ValueCache>,
    transmit: Arc<TransmitBuffer>,
    batch_window_ms: Arc<AtomicU64>,
}

impl BatchTransmitter {
    pub fn new(
        channel: Arc<ControlChannel>,
        value_cache: Arc<ValueCache>,
        transmit: Arc<TransmitBuffer>,
        batch_window_ms: Arc<AtomicU64>,
    ) -> Arc<Self> {
        Arc::new(Self { channel, value_cache, transmit, batch_window_ms })
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let wait_ms = self.batch_window_ms.load(Ordering::Relaxed).max(1);
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                self.tick().await;
            }
        })
    }

    async fn tick(&self) {
        if !self.channel.is_open() {
            return;
        }

        let timestamp = iteration_timestamp();

        if self.transmit.should_send_full_refresh() {
            let updates = self
                .value_cache
                .snapshot()
                .into_iter()
                .map(|(device_id, register_id, value)| UpdateItem { device_id, register_id, value: Some(value) })
                .collect();
            let frame = DataUpdateFrame::new(timestamp, true, updates);
            if self.channel.send_json(&frame).is_ok() {
                self.transmit.reset_full_refresh_timer();
            }
            return;
        }

        if self.transmit.is_empty() {
            return;
        }

        let updates = self
            .transmit
            .drain()
            .into_iter()
            .map(|sample| UpdateItem { device_id: sample.device_id, register_id: sample.register_id, value: sample.value })
            .collect();
        let frame = DataUpdateFrame::new(timestamp, false, updates);
        let _ = self.channel.send_json(&frame);
    }
}

/// Reports `{buffering_status, buffered_records}` whenever either changes.
pub struct StatusReporter {
    http: CloudHttpClient,
    channel: Arc<ControlChannel>,
    offline: Arc<OfflineBuffer>,
    last: StdMutex<Option<(BufferingStatus, u64)>>,
}

impl StatusReporter {
    pub fn new(http: CloudHttpClient, channel: Arc<ControlChannel>, offline: Arc<OfflineBuffer>) -> Arc<Self> {
        Arc::new(Self { http, channel, offline, last: StdMutex::new(None) })
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATUS_POLL_INTERVAL);
            loop {
                interval.tick().await;
                self.check().await;
            }
        })
    }

    async fn check(&self) {
        let buffering_status = if self.channel.is_open() { BufferingStatus::Online } else { BufferingStatus::Buffering };
        let buffered_records = self.offline.record_count().await.unwrap_or(0).max(0) as u64;

        let changed = {
            let mut last = self.last.lock().expect("status lock poisoned");
            let changed = *last != Some((buffering_status, buffered_records));
            *last = Some((buffering_status, buffered_records));
            changed
        };
        if !changed {
            return;
        }

        let (Some(agent_id), Some(jwt)) = (self.channel.agent_id(), self.channel.jwt()) else { return };
        let patch = StatusPatch { buffering_status, buffered_records };
        if let Err(err) = self.http.patch_status(&agent_id, &jwt, patch).await {
            warn!(error = %err, "status patch failed");
        }
    }
}

/// Wires the control channel plus its four periodic companions together and
/// owns their join handles.
pub struct CloudRuntime {
    pub channel: Arc<ControlChannel>,
    pub applier: Arc<ConfigApplier>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct CloudRuntimeConfig {
    pub endpoints: CloudEndpoints,
    pub registration_token: String,
    pub batch_window_ms: u64,
    pub historical_batch_interval_ms: u64,
}

impl CloudRuntime {
    pub fn spawn(
        config: CloudRuntimeConfig,
        pool: Arc<ConnectionPool>,
        value_cache: Arc<ValueCache>,
        transmit: Arc<TransmitBuffer>,
        historical: Arc<HistoricalBuffer>,
        offline: Arc<OfflineBuffer>,
    ) -> Self {
        let http = CloudHttpClient::new(config.endpoints);
        let scheduler = Arc::new(PollingScheduler::new(PollerHandles {
            pool: Arc::clone(&pool),
            value_cache: Arc::clone(&value_cache),
            transmit: Arc::clone(&transmit),
            historical: Arc::clone(&historical),
        }));
        let batch_window_ms = Arc::new(AtomicU64::new(config.batch_window_ms.max(1)));
        let applier = Arc::new(ConfigApplier::new(scheduler, Arc::clone(&transmit), Arc::clone(&batch_window_ms)));
        let handler: Arc<dyn CommandHandler> = Arc::new(DefaultCommandHandler::new(Arc::clone(&pool), Arc::clone(&applier)));
        let channel = ControlChannel::new(http.clone(), config.registration_token, Arc::clone(&offline), handler);

        let tasks = vec![
            tokio::spawn(Arc::clone(&channel).run()),
            ConfigWatcher::new(http.clone(), Arc::clone(&channel), Arc::clone(&applier)).spawn(),
            BulkUploader::new(
                http.clone(),
                Arc::clone(&channel),
                historical,
                Arc::clone(&offline),
                config.historical_batch_interval_ms,
            )
            .spawn(),
            BatchTransmitter::new(Arc::clone(&channel), value_cache, transmit, batch_window_ms).spawn(),
            StatusReporter::new(http, Arc::clone(&channel), offline).spawn(),
        ];

        Self { channel, applier, tasks }
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
