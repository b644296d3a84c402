//! Ghost Node - server-less world sync
//!
//! A peer in a Ghost Mesh: a room of peers collaboratively editing one
//! shared world without a central server. Signaling relays only introduce
//! peers; everything else is replicated peer to peer.
//!
//! # Architecture
//!
//! - **Blackboard**: process-wide context facets with subscribe/notify
//! - **Mesh**: replicated map plus ephemeral events over a relay link,
//!   heartbeat liveness and min-id host election
//! - **Sync**: throttled bridge between blackboard and mesh
//! - **Store**: reducer-owned world state, fed only by arbitrated worlds
//! - **Relay**: in-memory and TCP signaling relays (`ghost-relay` binary)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ghost_node::{GhostConfig, GhostNode, PeerId, SignalingRelay, TcpRelay};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GhostConfig::from_env()?;
//!     let relays: Vec<Arc<dyn SignalingRelay>> = config
//!         .relay_endpoints()
//!         .into_iter()
//!         .map(|addr| Arc::new(TcpRelay::new(addr)) as Arc<dyn SignalingRelay>)
//!         .collect();
//!     let node = Arc::new(GhostNode::new(PeerId::random(), config, relays)?);
//!     node.start().await?;
//!     Ok(())
//! }
//! ```

pub mod blackboard;
pub mod config;
pub mod error;
pub mod mesh;
pub mod node;
pub mod relay;
pub mod scheduler;
pub mod store;
pub mod sync;

pub use blackboard::{Blackboard, ContextChange, SubscriberId, UpdateSource};
pub use config::GhostConfig;
pub use error::{Error, Result};
pub use ghost_replica::PeerId;
pub use mesh::{ConnectionStatus, GhostMesh};
pub use node::{GhostNode, WorldProducer};
pub use relay::{MemoryHub, MemoryRelay, RelayLink, RelayServer, SignalingRelay, TcpRelay};
pub use scheduler::{Scheduler, TimerHandle, TimerSet};
pub use store::{StateChange, WorldStore};
pub use sync::{SyncBridge, SyncGate};
