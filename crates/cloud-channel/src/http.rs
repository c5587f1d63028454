//! HTTP control-plane clients: auth exchange, config polling, bulk ingest,
//! status reporting.

use thiserror::Error;
use types::Sample;

use crate::frames::{AuthRequest, AuthResponse, ConfigResponse, IngestRequest, IngestResponse, StatusPatch};

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http endpoint returned {status}")]
    Status { status: reqwest::StatusCode },
    #[error("invalid config payload: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone)]
pub struct CloudEndpoints {
    pub auth_url: String,
    pub ws_url: String,
    pub config_url: String,
    pub ingest_url: String,
    pub agent_status_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CloudHttpClient {
    client: reqwest::Client,
    endpoints: CloudEndpoints,
}

impl CloudHttpClient {
    pub fn new(endpoints: CloudEndpoints) -> Self {
        Self { client: reqwest::Client::new(), endpoints }
    }

    pub async fn authenticate(&self, registration_token: &str) -> Result<AuthResponse, HttpError> {
        let response = self
            .client
            .post(&self.endpoints.auth_url)
            .json(&AuthRequest { registration_token: registration_token.to_string() })
            .send()
            .await?;
        check_status(&response)?;
        Ok(response.json().await?)
    }

    pub fn websocket_url(&self, jwt: &str) -> String {
        let separator = if self.endpoints.ws_url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.endpoints.ws_url, separator, jwt)
    }

    pub async fn fetch_config(&self, jwt: &str) -> Result<ConfigResponse, HttpError> {
        let response = self
            .client
            .get(&self.endpoints.config_url)
            .bearer_auth(jwt)
            .send()
            .await?;
        check_status(&response)?;
        let body: serde_json::Value = response.json().await?;
        normalize_config_body(body)
    }

    pub async fn ingest(&self, agent_id: &str, jwt: &str, data_points: Vec<Sample>) -> Result<IngestResponse, HttpError> {
        let response = self
            .client
            .post(&self.endpoints.ingest_url)
            .bearer_auth(jwt)
            .json(&IngestRequest { agent_id: agent_id.to_string(), data_points })
            .send()
            .await?;
        check_status(&response)?;
        Ok(response.json().await?)
    }

    pub async fn patch_status(&self, agent_id: &str, jwt: &str, patch: StatusPatch) -> Result<(), HttpError> {
        let url = format!("{}?id=eq.{agent_id}", self.endpoints.agent_status_url);
        let mut request = self.client.patch(&url).bearer_auth(jwt).json(&patch);
        if let Some(api_key) = &self.endpoints.api_key {
            request = request.header("apikey", api_key);
        }
        let response = request.send().await?;
        check_status(&response)?;
        Ok(())
    }
}

fn check_status(response: &reqwest::Response) -> Result<(), HttpError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(HttpError::Status { status: response.status() })
    }
}

/// Infers the `protocol` field on each device's `connection` object before
/// the config response is parsed into [`ConfigResponse`]'s tagged-enum
/// types, so a cloud config payload that omits `protocol` (the case
/// `infer_protocol` exists to handle) still deserializes correctly.
fn normalize_config_body(mut body: serde_json::Value) -> Result<ConfigResponse, HttpError> {
    if let Some(polling_config) = body.get_mut("config").and_then(|c| c.get_mut("polling_config")) {
        let normalized = modbus_client::infer_protocols_in_polling_config(polling_config.take())
            .map_err(|err| HttpError::InvalidConfig(err.to_string()))?;
        *polling_config = normalized;
    }
    serde_json::from_value(body).map_err(|err| HttpError::InvalidConfig(err.to_string()))
}
