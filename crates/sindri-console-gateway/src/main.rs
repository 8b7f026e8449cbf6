mod auth;
mod backend;
mod config;
mod effects;
mod fanout;
mod gateway;
mod heartbeat;
mod kv;
mod logging;
mod metrics_buffer;
mod pubsub;
mod redis_backend;
mod registry;
mod router;
mod server;
mod sqlite;
mod streams;

use crate::backend::{Backends, KvStore, PubSub};
use crate::config::load_config;
use crate::fanout::{spawn_command_relay, spawn_fanout};
use crate::gateway::Gateway;
use crate::kv::MemoryKv;
use crate::logging::init_logging;
use crate::metrics_buffer::{spawn_metric_buffer, MetricBufferConfig};
use crate::pubsub::MemoryPubSub;
use crate::redis_backend::RedisBackend;
use crate::sqlite::SqliteBackend;
use anyhow::Context;
use sindri_console_storage::ConsoleStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

const KV_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    let log_guard = init_logging(&config);
    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr))?;

    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = ConsoleStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let sqlite = Arc::new(SqliteBackend::new(store));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let (pubsub, kv): (Arc<dyn PubSub>, Arc<dyn KvStore>) = match &config.redis_url {
        Some(url) => {
            let redis = Arc::new(RedisBackend::connect(url).await.context("connecting to redis")?);
            info!(event = "backend_selected", backend = "redis");
            (redis.clone() as Arc<dyn PubSub>, redis as Arc<dyn KvStore>)
        }
        None => {
            let kv = Arc::new(MemoryKv::new());
            tasks.push(kv.clone().spawn_sweeper(KV_SWEEP_INTERVAL, shutdown_rx.clone()));
            info!(event = "backend_selected", backend = "memory");
            (
                Arc::new(MemoryPubSub::default()) as Arc<dyn PubSub>,
                kv as Arc<dyn KvStore>,
            )
        }
    };
    let backends = Backends {
        pubsub,
        kv,
        credentials: sqlite.clone(),
        telemetry: sqlite,
    };

    let (metrics, flusher) = spawn_metric_buffer(
        backends.telemetry.clone(),
        MetricBufferConfig::from(&config),
        shutdown_rx.clone(),
    );
    let gateway = Arc::new(Gateway::new(config.clone(), backends, metrics));
    tasks.push(flusher);
    tasks.push(spawn_fanout(gateway.clone(), shutdown_rx.clone()).await?);
    tasks.push(spawn_command_relay(gateway.clone(), shutdown_rx).await?);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(
        event = "gateway_start",
        addr = %addr,
        node_id = %config.node_id,
        db_path = %config.db_path.display(),
        log_file = %log_guard
            .as_ref()
            .and_then(|guard| guard.path())
            .map(|path| path.display().to_string())
            .unwrap_or_default()
    );

    let shutdown_gateway = gateway.clone();
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "gateway_shutdown_requested");
        shutdown_gateway.begin_shutdown();
    };
    let served = axum::serve(
        listener,
        server::router(gateway).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;
    if let Err(err) = &served {
        error!(event = "gateway_error", error = %err);
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    info!(event = "gateway_stopped");
    served.context("serving")
}
