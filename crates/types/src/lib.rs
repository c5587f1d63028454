//! Shared data model for the Modbus polling agent.
//!
//! Every other crate in this workspace depends on `types` for the identities
//! and value objects that flow between the connection pool, the buffers, the
//! scheduler, and the cloud control channel. Nothing here talks to the
//! network or the filesystem.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Transport a [`Device`] is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Rtu,
}

/// Modbus function code used for a read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionCode {
    ReadCoils = 1,
    ReadDiscreteInputs = 2,
    ReadHoldingRegisters = 3,
    ReadInputRegisters = 4,
    WriteSingleCoil = 5,
    WriteSingleRegister = 6,
    WriteMultipleCoils = 15,
    WriteMultipleRegisters = 16,
}

impl Default for FunctionCode {
    fn default() -> Self {
        FunctionCode::ReadHoldingRegisters
    }
}

/// Connection parameters for one [`Device`], keyed canonically by the pool.
///
/// Only the fields that affect wire identity participate in the pool's cache
/// key (see `modbus_client::ConnectionKey`); fields like `timeout_ms` are
/// tuning knobs and must not fragment the cache (spec §9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ConnectionParams {
    Tcp {
        #[serde(alias = "deviceIp", alias = "ip")]
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
        #[serde(default = "default_unit_id")]
        unit_id: u8,
        timeout_ms: Option<u64>,
    },
    Rtu {
        #[serde(alias = "serialPort")]
        serial_port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_unit_id")]
        unit_id: u8,
        timeout_ms: Option<u64>,
    },
}

pub fn default_tcp_port() -> u16 {
    502
}

pub fn default_unit_id() -> u8 {
    1
}

pub fn default_baud_rate() -> u32 {
    9_600
}

impl ConnectionParams {
    pub fn unit_id(&self) -> u8 {
        match self {
            ConnectionParams::Tcp { unit_id, .. } => *unit_id,
            ConnectionParams::Rtu { unit_id, .. } => *unit_id,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            ConnectionParams::Tcp { .. } => Protocol::Tcp,
            ConnectionParams::Rtu { .. } => Protocol::Rtu,
        }
    }
}

/// One register, identified within its owning [`PollGroup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub register_id: String,
    pub address: u32,
    #[serde(default)]
    pub function_code: Option<FunctionCode>,
}

/// A set of registers sharing one poll interval on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollGroup {
    pub group_id: String,
    pub interval_ms: u64,
    pub registers: Vec<Register>,
}

/// A Modbus endpoint owning zero or more poll groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub connection: ConnectionParams,
    pub groups: Vec<PollGroup>,
}

/// Tuning knobs plus the device tree for one active configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    pub config_id: String,
    #[serde(default)]
    pub config_name: Option<String>,
    #[serde(default = "default_full_refresh_interval_ms")]
    pub full_refresh_interval_ms: u64,
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    #[serde(default = "default_historical_batch_interval_ms")]
    pub historical_batch_interval_ms: u64,
    pub devices: Vec<Device>,
}

pub fn default_full_refresh_interval_ms() -> u64 {
    300_000
}

pub fn default_batch_window_ms() -> u64 {
    2_000
}

pub fn default_historical_batch_interval_ms() -> u64 {
    60_000
}

/// Quality tag attached to every sample; `Bad` always pairs with `value = None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Good,
    Bad,
}

/// One observed (or failed) register read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device_id: String,
    pub register_id: String,
    pub value: Option<u16>,
    /// ISO-8601 UTC timestamp with millisecond precision.
    pub timestamp: String,
    pub quality: Quality,
}

impl Sample {
    pub fn good(device_id: impl Into<String>, register_id: impl Into<String>, value: u16, timestamp: &str) -> Self {
        Self {
            device_id: device_id.into(),
            register_id: register_id.into(),
            value: Some(value),
            timestamp: timestamp.to_string(),
            quality: Quality::Good,
        }
    }

    pub fn bad(device_id: impl Into<String>, register_id: impl Into<String>, timestamp: &str) -> Self {
        Self {
            device_id: device_id.into(),
            register_id: register_id.into(),
            value: None,
            timestamp: timestamp.to_string(),
            quality: Quality::Bad,
        }
    }
}

/// Generates one iteration timestamp shared by every register read in a poll iteration.
pub fn iteration_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_sample_always_has_no_value() {
        let sample = Sample::bad("dev-1", "reg-1", "2026-01-01T00:00:00.000Z");
        assert_eq!(sample.value, None);
        assert_eq!(sample.quality, Quality::Bad);
    }

    #[test]
    fn connection_params_round_trip_tcp_alias() {
        let json = r#"{"protocol":"tcp","deviceIp":"10.0.0.5","port":502}"#;
        let params: ConnectionParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.unit_id(), 1);
        assert_eq!(params.protocol(), Protocol::Tcp);
    }

    #[test]
    fn iteration_timestamp_has_millisecond_precision() {
        let ts = iteration_timestamp();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('.'));
    }
}
