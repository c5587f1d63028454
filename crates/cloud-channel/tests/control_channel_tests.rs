use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::routing::{get, patch, post};
use axum::{Json, Router};
use buffer::{HistoricalBuffer, OfflineBuffer, TransmitBuffer, ValueCache};
use cloud_channel::http::CloudEndpoints;
use cloud_channel::{ChannelState, CloudRuntime, CloudRuntimeConfig};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use modbus_client::ConnectionPool;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn control_channel_authenticates_connects_and_receives_welcome() {
    let ws_addr = spawn_ws_welcome_server().await;
    let http_addr = spawn_http_mock_server().await;

    let endpoints = CloudEndpoints {
        auth_url: format!("http://{http_addr}/auth"),
        ws_url: format!("ws://{ws_addr}/ws"),
        config_url: format!("http://{http_addr}/config"),
        ingest_url: format!("http://{http_addr}/ingest"),
        agent_status_url: format!("http://{http_addr}/status"),
        api_key: None,
    };

    let offline_path = temp_db_path("cloud_channel_open");
    let offline = Arc::new(OfflineBuffer::new(offline_path.to_str().unwrap()).await.unwrap());

    let mut runtime = CloudRuntime::spawn(
        CloudRuntimeConfig {
            endpoints,
            registration_token: "test-token".to_string(),
            batch_window_ms: 2_000,
            historical_batch_interval_ms: 60_000,
        },
        Arc::new(ConnectionPool::new()),
        Arc::new(ValueCache::new()),
        Arc::new(TransmitBuffer::new(300_000)),
        Arc::new(HistoricalBuffer::new(1_000)),
        Arc::clone(&offline),
    );

    let mut state_rx = runtime.channel.subscribe();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while *state_rx.borrow() != ChannelState::Open {
        assert!(tokio::time::Instant::now() < deadline, "channel never reached Open");
        let _ = tokio::time::timeout(Duration::from_millis(200), state_rx.changed()).await;
    }

    let welcome_deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while runtime.channel.agent_id().is_none() {
        assert!(tokio::time::Instant::now() < welcome_deadline, "welcome frame never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(runtime.channel.agent_id().as_deref(), Some("agent-xyz"));
    assert!(runtime.channel.jwt().is_some());

    runtime.shutdown();
    cleanup_db(&offline_path);
}

#[tokio::test]
async fn control_channel_buffers_offline_when_cloud_is_unreachable() {
    let endpoints = CloudEndpoints {
        auth_url: "http://127.0.0.1:1/auth".to_string(),
        ws_url: "ws://127.0.0.1:1/ws".to_string(),
        config_url: "http://127.0.0.1:1/config".to_string(),
        ingest_url: "http://127.0.0.1:1/ingest".to_string(),
        agent_status_url: "http://127.0.0.1:1/status".to_string(),
        api_key: None,
    };

    let offline_path = temp_db_path("cloud_channel_offline");
    let offline = Arc::new(OfflineBuffer::new(offline_path.to_str().unwrap()).await.unwrap());
    assert!(offline.is_buffering());

    let mut runtime = CloudRuntime::spawn(
        CloudRuntimeConfig {
            endpoints,
            registration_token: "test-token".to_string(),
            batch_window_ms: 2_000,
            historical_batch_interval_ms: 60_000,
        },
        Arc::new(ConnectionPool::new()),
        Arc::new(ValueCache::new()),
        Arc::new(TransmitBuffer::new(300_000)),
        Arc::new(HistoricalBuffer::new(1_000)),
        Arc::clone(&offline),
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(runtime.channel.state(), ChannelState::Disconnected);
    assert!(offline.is_buffering());

    runtime.shutdown();
    cleanup_db(&offline_path);
}

async fn spawn_ws_welcome_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                let welcome = json!({"type": "connected", "agentId": "agent-xyz"}).to_string();
                let _ = ws.send(Message::Text(welcome)).await;
                while ws.next().await.is_some() {}
            }
        }
    });
    addr
}

async fn spawn_http_mock_server() -> SocketAddr {
    let app = Router::new()
        .route("/auth", post(|| async { Json(json!({"jwt": fake_jwt(), "expiresIn": 3600, "expires_in": 3600})) }))
        .route("/config", get(|| async { Json(json!({"hasConfig": false, "config": null})) }))
        .route("/ingest", post(|| async { Json(json!({"success": true})) }))
        .route("/status", patch(|| async { Json(json!({})) }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn fake_jwt() -> String {
    #[derive(Serialize)]
    struct Claims {
        exp: i64,
    }
    let exp = chrono::Utc::now().timestamp() + 3600;
    encode(&Header::default(), &Claims { exp }, &EncodingKey::from_secret(b"test-secret")).unwrap()
}

fn temp_db_path(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    std::env::temp_dir().join(format!("{prefix}_{}_{}.sqlite", std::process::id(), nanos))
}

fn cleanup_db(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(format!("{}-wal", path.display()));
    let _ = std::fs::remove_file(format!("{}-shm", path.display()));
}
