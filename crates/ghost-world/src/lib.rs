//! Ghost World
//!
//! The locally owned world and the gate in front of it.
//!
//! - [`model`]: entities, environment, [`WorldStateSnapshot`]
//! - [`reduce`]: pure `(AppState, Action) -> AppState`
//! - [`Arbitrator`]: schema, security filter, stabilization and consistency
//!   checks applied to every candidate world before it may reach the reducer

mod arbitrator;
pub mod error;
pub mod model;
mod reducer;

pub use arbitrator::{
    stabilize, Arbitration, Arbitrator, ConsistencyPolicy, Consensus, DivergencePolicy, ProposalSource,
    SecurityFilter, StabilizationConfig,
};
pub use error::{ArbitrationError, Result};
pub use model::{Entity, EntityOrigin, Environment, SimMode, Vec3, WorldStateSnapshot};
pub use reducer::{reduce, Action, AppState, Impact, Presence, Quest, QuestStep, IMPACT_CAP, LOG_CAP};
