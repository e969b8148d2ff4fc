use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chatline_core::credentials::FileCredentialStore;
use chatline_core::inbound::{InboundQueue, InboundRelay, MemoryInboundQueue, DEFAULT_INBOUND_QUEUE};
use chatline_core::limiter::{
    AtomicRateLimiter, AtomicScriptStore, BucketConfig, MemoryScriptStore, DEFAULT_KEY_PREFIX,
};
use chatline_core::{ReconnectPolicy, SessionSupervisor, SupervisorConfig};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use redis::aio::ConnectionManager;
use tokio::{signal, sync::watch};
use tracing::{info, warn};

mod bridge;
mod broadcast;
mod redis_store;
mod routes;
mod send_window;
mod telemetry;

#[cfg(test)]
mod test_support;

use bridge::BridgeConnector;
use broadcast::{build_observer_router, ObserverState};
use redis_store::{RedisInboundQueue, RedisScriptStore, DEFAULT_QUEUE_PREFIX};
use routes::{build_router, AppState};
use send_window::SendWindow;

#[derive(Debug, Clone)]
struct ServerConfig {
    http_addr: SocketAddr,
    ws_addr: SocketAddr,
    redis_url: String,
    session_dir: PathBuf,
    api_base_url: String,
    bridge_url: String,
    bucket: BucketConfig,
    bucket_prefix: String,
    inbound_queue: String,
    inbound_buffer: usize,
    supervisor: SupervisorConfig,
    shutdown_grace: Duration,
    memory_store: bool,
}

#[derive(Debug, Parser)]
#[command(
    name = "chatline-server",
    author,
    version,
    about = "Chat protocol gateway: session supervision, rate-limited sends and status events"
)]
struct Cli {
    /// Address for the HTTP API.
    #[arg(long, env = "CHATLINE_HTTP_ADDR", default_value = "0.0.0.0:4001")]
    http_addr: String,

    /// Address for the observer event stream.
    #[arg(long, env = "CHATLINE_WS_ADDR", default_value = "0.0.0.0:4002")]
    ws_addr: String,

    /// Redis holding the rate limiter buckets and the inbound queue.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Directory where per-session credentials are persisted.
    #[arg(long, env = "CHATLINE_SESSION_DIR", default_value = "./sessions")]
    session_dir: PathBuf,

    /// Downstream API base URL advertised to observers.
    #[arg(long, env = "API_BASE_URL", default_value = "http://localhost:4000")]
    api_base_url: String,

    /// Protocol bridge WebSocket base URL.
    #[arg(long, env = "CHATLINE_BRIDGE_URL", default_value = "ws://127.0.0.1:4100")]
    bridge_url: String,

    #[arg(long, env = "CHATLINE_RATE_PER_SECOND", default_value_t = 1.0)]
    rate_per_second: f64,

    #[arg(long, env = "CHATLINE_BURST", default_value_t = 5)]
    burst: u32,

    #[arg(long, env = "CHATLINE_MAX_PER_MINUTE", default_value_t = 50)]
    max_per_minute: u32,

    /// Key prefix for rate limiter buckets.
    #[arg(long, env = "CHATLINE_BUCKET_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    bucket_prefix: String,

    /// Queue receiving inbound messages.
    #[arg(long, env = "CHATLINE_INBOUND_QUEUE", default_value = DEFAULT_INBOUND_QUEUE)]
    inbound_queue: String,

    /// Inbound batches buffered in process before new ones are dropped.
    #[arg(long, env = "CHATLINE_INBOUND_BUFFER", default_value_t = 1024)]
    inbound_buffer: usize,

    #[arg(long, env = "CHATLINE_RECONNECT_BASE_MS", default_value_t = 1_000)]
    reconnect_base_ms: u64,

    #[arg(long, env = "CHATLINE_RECONNECT_MAX_MS", default_value_t = 30_000)]
    reconnect_max_ms: u64,

    /// Consecutive failed reconnects before pausing a session (0 = never).
    #[arg(long, env = "CHATLINE_RECONNECT_MAX_ATTEMPTS", default_value_t = 10)]
    reconnect_max_attempts: u32,

    /// Deadline for a single outbound dispatch.
    #[arg(long, env = "CHATLINE_SEND_TIMEOUT_SECS", default_value_t = 30)]
    send_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CHATLINE_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,

    /// Keep buckets and the inbound queue in process memory (development only).
    #[arg(long, env = "CHATLINE_MEMORY_STORE", default_value_t = false)]
    memory_store: bool,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let http_addr: SocketAddr = cli
            .http_addr
            .parse()
            .with_context(|| format!("invalid http address: {}", cli.http_addr))?;
        let ws_addr: SocketAddr = cli
            .ws_addr
            .parse()
            .with_context(|| format!("invalid event stream address: {}", cli.ws_addr))?;

        let bucket = BucketConfig {
            rate_per_second: cli.rate_per_second,
            burst: cli.burst,
            max_per_minute: cli.max_per_minute,
        };
        bucket.validate().context("invalid rate limit settings")?;

        if cli.reconnect_base_ms == 0 || cli.reconnect_max_ms < cli.reconnect_base_ms {
            anyhow::bail!(
                "reconnect delays must satisfy 0 < base ({}) <= max ({})",
                cli.reconnect_base_ms,
                cli.reconnect_max_ms
            );
        }
        if cli.send_timeout_secs == 0 {
            anyhow::bail!("send timeout must be at least one second");
        }

        Ok(ServerConfig {
            http_addr,
            ws_addr,
            redis_url: cli.redis_url,
            session_dir: cli.session_dir,
            api_base_url: cli.api_base_url,
            bridge_url: cli.bridge_url,
            bucket,
            bucket_prefix: cli.bucket_prefix,
            inbound_queue: cli.inbound_queue,
            inbound_buffer: cli.inbound_buffer.max(1),
            supervisor: SupervisorConfig {
                reconnect: ReconnectPolicy {
                    base: Duration::from_millis(cli.reconnect_base_ms),
                    max: Duration::from_millis(cli.reconnect_max_ms),
                    max_attempts: cli.reconnect_max_attempts,
                },
                send_timeout: Duration::from_secs(cli.send_timeout_secs),
                ..SupervisorConfig::default()
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            memory_store: cli.memory_store,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        http_addr = %config.http_addr,
        ws_addr = %config.ws_addr,
        bridge_url = %config.bridge_url,
        memory_store = config.memory_store,
        "starting chatline gateway"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let (script_store, queue): (Arc<dyn AtomicScriptStore>, Arc<dyn InboundQueue>) =
        if config.memory_store {
            warn!("using in-process rate limiter and inbound queue; limits are not shared");
            (
                Arc::new(MemoryScriptStore::new()),
                Arc::new(MemoryInboundQueue::new()),
            )
        } else {
            let client = redis::Client::open(config.redis_url.clone())
                .context("failed to create redis client")?;
            let manager = ConnectionManager::new(client)
                .await
                .context("failed to connect to redis")?;
            let queue = RedisInboundQueue::new(
                manager.clone(),
                DEFAULT_QUEUE_PREFIX,
                &config.inbound_queue,
            );
            info!(queue = queue.key(), "inbound queue ready");
            (Arc::new(RedisScriptStore::new(manager)), Arc::new(queue))
        };

    let limiter = AtomicRateLimiter::new(script_store, config.bucket)
        .with_key_prefix(config.bucket_prefix.clone());
    let credentials = FileCredentialStore::open(&config.session_dir)
        .await
        .with_context(|| {
            format!(
                "failed to prepare session directory {}",
                config.session_dir.display()
            )
        })?;
    let (relay, relay_worker) = InboundRelay::spawn(queue, config.inbound_buffer);
    let supervisor = SessionSupervisor::new(
        Arc::new(BridgeConnector::new(config.bridge_url.clone())),
        Arc::new(credentials),
        Arc::new(limiter),
        relay,
        config.supervisor.clone(),
    );

    let api = build_router(Arc::new(AppState {
        supervisor: supervisor.clone(),
        send_window: SendWindow::new(),
        metrics,
    }));
    let (stop_tx, stop_rx) = watch::channel(false);
    let observers = build_observer_router(Arc::new(ObserverState {
        supervisor: supervisor.clone(),
        api_base_url: config.api_base_url.clone(),
        stop: stop_rx.clone(),
    }));

    let api_listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .context("failed to bind http listener")?;
    let ws_listener = tokio::net::TcpListener::bind(config.ws_addr)
        .await
        .context("failed to bind event stream listener")?;
    info!("chatline api listening on {}", config.http_addr);
    info!("chatline event stream listening on {}", config.ws_addr);

    let api_stop = stop_rx.clone();
    let api_server = async move {
        axum::serve(api_listener, api)
            .with_graceful_shutdown(stopped(api_stop))
            .await
    };
    let ws_server = async move {
        axum::serve(ws_listener, observers)
            .with_graceful_shutdown(stopped(stop_rx))
            .await
    };
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let (api_result, ws_result) = tokio::join!(api_server, ws_server);
    api_result.context("api server shutdown with error")?;
    ws_result.context("event stream server shutdown with error")?;
    signal_task.abort();

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; closing sessions"
    );
    let deadline = tokio::time::Instant::now() + config.shutdown_grace;
    supervisor.shutdown().await;
    drop(supervisor);
    if tokio::time::timeout_at(deadline, relay_worker).await.is_err() {
        warn!("inbound relay did not drain within the grace period");
    }
    tokio::time::sleep_until(deadline).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

pub(crate) async fn stopped(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}
