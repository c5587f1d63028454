use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:9090";
const DEFAULT_OFFLINE_BUFFER_PATH: &str = "offline-buffer.sqlite";
const DEFAULT_OFFLINE_BUFFER_MAX_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_HISTORICAL_BUFFER_CAPACITY: usize = 100_000;

/// Layered configuration: defaults, then an optional TOML/JSON file, then
/// environment variables, then CLI flags (applied by `main` after `load`).
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub registration_token: String,
    pub auth_url: String,
    pub ws_url: String,
    pub config_url: String,
    pub ingest_url: String,
    pub agent_status_url: String,
    pub api_key: Option<String>,
    pub bind_addr: String,
    pub offline_buffer_path: String,
    pub offline_buffer_max_bytes: u64,
    pub historical_buffer_capacity: usize,
    pub full_refresh_interval_ms: u64,
    pub batch_window_ms: u64,
    pub historical_batch_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            registration_token: String::new(),
            auth_url: String::new(),
            ws_url: String::new(),
            config_url: String::new(),
            ingest_url: String::new(),
            agent_status_url: String::new(),
            api_key: None,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            offline_buffer_path: DEFAULT_OFFLINE_BUFFER_PATH.to_string(),
            offline_buffer_max_bytes: DEFAULT_OFFLINE_BUFFER_MAX_BYTES,
            historical_buffer_capacity: DEFAULT_HISTORICAL_BUFFER_CAPACITY,
            full_refresh_interval_ms: types::default_full_refresh_interval_ms(),
            batch_window_ms: types::default_batch_window_ms(),
            historical_batch_interval_ms: types::default_historical_batch_interval_ms(),
        }
    }
}

impl AgentConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path)? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registration_token.trim().is_empty() {
            anyhow::bail!("registration token is required (--token or AGENT_TOKEN)");
        }
        for (name, value) in [
            ("auth_url", &self.auth_url),
            ("ws_url", &self.ws_url),
            ("config_url", &self.config_url),
            ("ingest_url", &self.ingest_url),
            ("agent_status_url", &self.agent_status_url),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{name} must be set (config file or AGENT_{} env var)", name.to_uppercase());
            }
        }
        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("bind address '{}' is not a valid host:port", self.bind_addr);
        }
        if self.historical_buffer_capacity == 0 {
            anyhow::bail!("historical_buffer_capacity must be >= 1");
        }
        if self.offline_buffer_max_bytes == 0 {
            anyhow::bail!("offline_buffer_max_bytes must be >= 1");
        }
        if self.full_refresh_interval_ms == 0 || self.batch_window_ms == 0 || self.historical_batch_interval_ms == 0 {
            anyhow::bail!("timing intervals must all be >= 1ms");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    registration_token: Option<String>,
    auth_url: Option<String>,
    ws_url: Option<String>,
    config_url: Option<String>,
    ingest_url: Option<String>,
    agent_status_url: Option<String>,
    api_key: Option<String>,
    bind_addr: Option<String>,
    offline_buffer_path: Option<String>,
    offline_buffer_max_bytes: Option<u64>,
    historical_buffer_capacity: Option<usize>,
    full_refresh_interval_ms: Option<u64>,
    batch_window_ms: Option<u64>,
    historical_batch_interval_ms: Option<u64>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("AGENT_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path).with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());
    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };
    Ok(Some(config))
}

fn apply_file_config(config: &mut AgentConfig, file: FileConfig) {
    if let Some(value) = file.registration_token {
        config.registration_token = value;
    }
    if let Some(value) = file.auth_url {
        config.auth_url = value;
    }
    if let Some(value) = file.ws_url {
        config.ws_url = value;
    }
    if let Some(value) = file.config_url {
        config.config_url = value;
    }
    if let Some(value) = file.ingest_url {
        config.ingest_url = value;
    }
    if let Some(value) = file.agent_status_url {
        config.agent_status_url = value;
    }
    if let Some(value) = file.api_key {
        config.api_key = Some(value);
    }
    if let Some(value) = file.bind_addr {
        config.bind_addr = value;
    }
    if let Some(value) = file.offline_buffer_path {
        config.offline_buffer_path = value;
    }
    if let Some(value) = file.offline_buffer_max_bytes {
        config.offline_buffer_max_bytes = value;
    }
    if let Some(value) = file.historical_buffer_capacity {
        config.historical_buffer_capacity = value;
    }
    if let Some(value) = file.full_refresh_interval_ms {
        config.full_refresh_interval_ms = value;
    }
    if let Some(value) = file.batch_window_ms {
        config.batch_window_ms = value;
    }
    if let Some(value) = file.historical_batch_interval_ms {
        config.historical_batch_interval_ms = value;
    }
}

fn apply_env_overrides(config: &mut AgentConfig) {
    if let Ok(value) = env::var("AGENT_TOKEN") {
        config.registration_token = value;
    }
    if let Ok(value) = env::var("AGENT_AUTH_URL") {
        config.auth_url = value;
    }
    if let Ok(value) = env::var("AGENT_WS_URL") {
        config.ws_url = value;
    }
    if let Ok(value) = env::var("AGENT_CONFIG_URL") {
        config.config_url = value;
    }
    if let Ok(value) = env::var("AGENT_INGEST_URL") {
        config.ingest_url = value;
    }
    if let Ok(value) = env::var("AGENT_STATUS_URL") {
        config.agent_status_url = value;
    }
    if let Ok(value) = env::var("AGENT_API_KEY") {
        config.api_key = Some(value);
    }
    if let Ok(value) = env::var("AGENT_BIND_ADDR") {
        config.bind_addr = value;
    }
    if let Ok(value) = env::var("AGENT_OFFLINE_BUFFER_PATH") {
        config.offline_buffer_path = value;
    }
    if let Some(value) = parse_env_u64("AGENT_OFFLINE_BUFFER_MAX_BYTES") {
        config.offline_buffer_max_bytes = value;
    }
    if let Some(value) = parse_env_usize("AGENT_HISTORICAL_BUFFER_CAPACITY") {
        config.historical_buffer_capacity = value;
    }
    if let Some(value) = parse_env_u64("AGENT_FULL_REFRESH_INTERVAL_MS") {
        config.full_refresh_interval_ms = value;
    }
    if let Some(value) = parse_env_u64("AGENT_BATCH_WINDOW_MS") {
        config.batch_window_ms = value;
    }
    if let Some(value) = parse_env_u64("AGENT_HISTORICAL_BATCH_INTERVAL_MS") {
        config.historical_batch_interval_ms = value;
    }
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
