//! Ghost Node binary
//!
//! Joins the configured room through the configured relays and runs until
//! interrupted.

use std::sync::Arc;

use ghost_node::{GhostConfig, GhostNode, PeerId, SignalingRelay, TcpRelay};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ghost_node=info,ghost=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GhostConfig::from_env()?;
    tracing::info!("Starting Ghost Node for room {}", config.room);

    let relays: Vec<Arc<dyn SignalingRelay>> = config
        .relay_endpoints()
        .into_iter()
        .map(|addr| Arc::new(TcpRelay::new(addr)) as Arc<dyn SignalingRelay>)
        .collect();

    let node = Arc::new(GhostNode::new(PeerId::random(), config, relays)?);
    node.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, leaving room");
    node.shutdown();

    Ok(())
}
