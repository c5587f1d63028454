//! Wire types for the HTTP control-plane endpoints and the WebSocket frames.

use serde::{Deserialize, Serialize};
use types::{PollingConfig, Sample};

#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest {
    pub registration_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub jwt: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigResponse {
    #[serde(rename = "hasConfig")]
    pub has_config: bool,
    pub config: Option<ConfigPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigPayload {
    pub id: String,
    #[serde(default)]
    pub config_name: Option<String>,
    pub polling_config: PollingConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRequest {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "dataPoints")]
    pub data_points: Vec<Sample>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestResponse {
    pub success: bool,
    #[serde(default)]
    pub inserted: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub errors: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusPatch {
    pub buffering_status: BufferingStatus,
    pub buffered_records: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferingStatus {
    Online,
    Buffering,
}

/// `{type:"connected", agentId}` — the first frame the server sends on open.
#[derive(Debug, Clone, Deserialize)]
pub struct WelcomeFrame {
    #[serde(rename = "agentId")]
    pub agent_id: String,
}

/// An inbound command frame. Either naming convention is accepted:
/// `{command, commandId}` or `{type, command_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundCommand {
    #[serde(alias = "type")]
    pub command: String,
    #[serde(rename = "commandId", alias = "command_id", default)]
    pub command_id: Option<String>,
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataUpdateFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: String,
    pub is_full_refresh: bool,
    pub updates: Vec<UpdateItem>,
}

impl DataUpdateFrame {
    pub fn new(timestamp: String, is_full_refresh: bool, updates: Vec<UpdateItem>) -> Self {
        Self { kind: "data_update", timestamp, is_full_refresh, updates }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateItem {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "registerId")]
    pub register_id: String,
    pub value: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl Default for HeartbeatFrame {
    fn default() -> Self {
        Self { kind: "heartbeat" }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResultFrame {
    #[serde(rename = "commandId")]
    pub command_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandErrorFrame {
    #[serde(rename = "commandId")]
    pub command_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub error: String,
}

impl CommandErrorFrame {
    pub fn new(command_id: Option<String>, error: impl Into<String>) -> Self {
        Self { command_id, kind: "error", error: error.into() }
    }
}
