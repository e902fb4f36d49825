//! Push-Manager service binary
//!
//! Watches the registry for Connect-Nodes, keeps one dispatch client per
//! node, and serves the producer-facing broadcast RPC.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use pushrelay::config::Config;
use pushrelay::discovery::{self, MemoryRegistry, PUSH_MANAGER_SERVICE};
use pushrelay::dispatch::PushManager;
use pushrelay::rpc::{self, MAX_MESSAGE_SIZE};
use pushrelay::stats::Metrics;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("pushrelay=info".parse()?),
        )
        .init();

    let cfg = Config::load()?;
    tracing::info!(manager_id = %cfg.server.id, "starting push-manager");

    let registry = Arc::new(MemoryRegistry::new());
    let metrics = Arc::new(Metrics::new());
    let manager = PushManager::new(
        cfg.server.id.clone(),
        Arc::clone(&registry),
        cfg.rpc.timeout(),
        Arc::clone(&metrics),
    )
    .await?;

    let shutdown = CancellationToken::new();
    discovery::spawn_register(
        Arc::clone(&registry),
        PUSH_MANAGER_SERVICE,
        &cfg.server.addr,
        shutdown.clone(),
    );

    let listener = TcpListener::bind(&cfg.server.addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "broadcast rpc listening");

    tokio::select! {
        result = rpc::serve(listener, Arc::clone(&manager), MAX_MESSAGE_SIZE) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    shutdown.cancel();
    manager.close();
    let snapshot = metrics.snapshot();
    tracing::info!(?snapshot, "push-manager stopped");
    Ok(())
}
