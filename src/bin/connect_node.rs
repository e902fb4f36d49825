//! Connect-Node service binary
//!
//! Terminates client WebSocket sessions, serves the push RPC surface and
//! registers itself with the service registry so Push-Managers can find it.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use pushrelay::config::Config;
use pushrelay::discovery::{self, MemoryRegistry, CONNECT_NODE_SERVICE};
use pushrelay::rpc::{self, ControllerClient, MAX_MESSAGE_SIZE};
use pushrelay::server::listener::NodeListener;
use pushrelay::server::NodeServer;
use pushrelay::stats::Metrics;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("pushrelay=info".parse()?),
        )
        .init();

    let cfg = Config::load()?;
    tracing::info!(node_id = %cfg.server.id, "starting connect-node");

    let controller = ControllerClient::connect(&cfg.controller.addr, cfg.rpc.timeout()).await?;
    tracing::info!(addr = %cfg.controller.addr, "controller connected");

    let metrics = Arc::new(Metrics::new());
    let rpc_addr = cfg.server.addr.clone();
    let server = NodeServer::new(cfg, controller, Arc::clone(&metrics));

    // Push RPC surface for Push-Managers.
    let rpc_listener = TcpListener::bind(&rpc_addr).await?;
    tracing::info!(addr = %rpc_listener.local_addr()?, "push rpc listening");
    tokio::spawn(rpc::serve(rpc_listener, Arc::clone(&server), MAX_MESSAGE_SIZE));

    // Registry presence. The in-memory store covers single-process
    // deployments; a shared registry binding plugs in through the same
    // RegistryStore trait.
    let registry = Arc::new(MemoryRegistry::new());
    let shutdown = CancellationToken::new();
    discovery::spawn_register(
        Arc::clone(&registry),
        CONNECT_NODE_SERVICE,
        &rpc_addr,
        shutdown.clone(),
    );

    let listener = NodeListener::bind(Arc::clone(&server)).await?;
    tokio::select! {
        result = listener.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    shutdown.cancel();
    let snapshot = metrics.snapshot();
    tracing::info!(?snapshot, "connect-node stopped");
    Ok(())
}
