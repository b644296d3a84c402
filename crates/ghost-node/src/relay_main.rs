//! Ghost Relay binary
//!
//! Room-scoped signaling relay: fans each frame out to the other peers in
//! the sender's room.

use ghost_node::{GhostConfig, RelayServer};
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
    let server = RelayServer::bind(config.relay_listen_addr).await?;
    tracing::info!("Ghost Relay listening on {}", server.local_addr()?);
    server.run().await?;

    Ok(())
}
