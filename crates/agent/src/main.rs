use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use buffer::{HistoricalBuffer, OfflineBuffer, TransmitBuffer, ValueCache};
use clap::Parser;
use cloud_channel::http::CloudEndpoints;
use cloud_channel::{ChannelState, CloudRuntime, CloudRuntimeConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use modbus_client::ConnectionPool;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agent::AgentConfig;

/// Local Modbus-to-cloud polling agent.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Cloud registration token for this agent.
    #[arg(long, env = "AGENT_TOKEN")]
    token: Option<String>,
    /// Path to a TOML or JSON config file.
    #[arg(long)]
    config: Option<String>,
    /// Address the local health/metrics surface binds to.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let cli = Cli::parse();

    let mut config = AgentConfig::load(cli.config.as_deref()).context("load agent config")?;
    if let Some(token) = cli.token {
        config.registration_token = token;
    }
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Err(err) = config.validate() {
        error!(error = %err, "invalid configuration, exiting");
        std::process::exit(1);
    }

    let prometheus = PrometheusBuilder::new().install_recorder().context("install prometheus recorder")?;

    let pool = Arc::new(ConnectionPool::new());
    let value_cache = Arc::new(ValueCache::new());
    let transmit = Arc::new(TransmitBuffer::new(config.full_refresh_interval_ms));
    let historical = Arc::new(HistoricalBuffer::new(config.historical_buffer_capacity));
    let offline = Arc::new(
        OfflineBuffer::with_capacity(&config.offline_buffer_path, config.offline_buffer_max_bytes)
            .await
            .context("open offline buffer")?,
    );

    let endpoints = CloudEndpoints {
        auth_url: config.auth_url.clone(),
        ws_url: config.ws_url.clone(),
        config_url: config.config_url.clone(),
        ingest_url: config.ingest_url.clone(),
        agent_status_url: config.agent_status_url.clone(),
        api_key: config.api_key.clone(),
    };

    let mut runtime = CloudRuntime::spawn(
        CloudRuntimeConfig {
            endpoints,
            registration_token: config.registration_token.clone(),
            batch_window_ms: config.batch_window_ms,
            historical_batch_interval_ms: config.historical_batch_interval_ms,
        },
        pool,
        value_cache,
        transmit,
        historical,
        offline,
    );

    let bind_addr = config.bind_addr.clone();
    let health_router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.with_context(|| format!("bind {bind_addr}"))?;
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, health_router).await {
            error!(error = %err, "health/metrics server exited");
        }
    });
    info!(bind_addr = %bind_addr, "local observability surface listening");

    let ready_channel = Arc::clone(&runtime.channel);
    let readiness_task = tokio::spawn(async move {
        notify_ready_on_first_open(ready_channel).await;
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, tearing down");

    readiness_task.abort();
    server.abort();
    runtime.shutdown();

    info!("shutdown complete");
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_handler(State(handle): State<metrics_exporter_prometheus::PrometheusHandle>) -> String {
    handle.render()
}

/// Waits for the control channel's first transition to `Open`, then notifies
/// the service manager the agent is ready and starts watchdog pings.
async fn notify_ready_on_first_open(channel: Arc<cloud_channel::ControlChannel>) {
    let mut state_rx = channel.subscribe();
    while *state_rx.borrow() != ChannelState::Open {
        if state_rx.changed().await.is_err() {
            return;
        }
    }

    notify_ready();

    let mut watchdog_usec = 0u64;
    if cfg!(target_os = "linux") && sd_notify_watchdog_enabled(&mut watchdog_usec) {
        let interval = std::time::Duration::from_micros(watchdog_usec / 2).max(std::time::Duration::from_secs(1));
        loop {
            tokio::time::sleep(interval).await;
            notify_watchdog();
        }
    }
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        error!(error = %err, "sd_notify ready failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn notify_watchdog() {
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]);
}

#[cfg(not(target_os = "linux"))]
fn notify_watchdog() {}

#[cfg(target_os = "linux")]
fn sd_notify_watchdog_enabled(usec: &mut u64) -> bool {
    sd_notify::watchdog_enabled(false, usec)
}

#[cfg(not(target_os = "linux"))]
fn sd_notify_watchdog_enabled(_usec: &mut u64) -> bool {
    false
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("install SIGTERM handler");
        signal.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
