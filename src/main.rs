//! Word Ball Node
//!
//! Runs one player's node: binds the port, sweeps for peers, then serves
//! local clients and other nodes until Ctrl-C.

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use word_ball::{GameServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_env().context("Failed to read configuration")?;
    info!("Word Ball node v{}", VERSION);
    info!(
        "Quorum {}, peer timeout {:?}, {} explicit peers",
        config.session.quorum,
        config.peer_timeout,
        config.peers.len()
    );

    let server = std::sync::Arc::new(
        GameServer::bind(config)
            .await
            .context("Failed to start server")?,
    );
    info!("Node id {}", server.node().self_id());

    // Startup sweep; peers that come up later register with us
    let node = server.node().clone();
    tokio::spawn(async move {
        let found = node.discover().await;
        if found.is_empty() {
            warn!("No peers found yet");
        }
    });

    let runner = server.clone();
    let serve = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received, shutting down");
    server.shutdown();

    serve.await.context("Server task panicked")??;
    Ok(())
}
