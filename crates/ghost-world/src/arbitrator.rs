//! Arbitration gate for candidate world states.
//!
//! Every candidate, whatever its source, passes the same pipeline and stops
//! at the first failure:
//!
//! ```text
//! Value ─▶ schema ─▶ security filter ─▶ stabilization ─▶ consistency ─▶ Arbitration
//!           │           │                 (never fails)    (peer only,
//!           ▼           ▼                                   soft flag)
//!      SchemaMismatch  SecurityViolation
//! ```
//!
//! A rejected candidate yields `success: false` and no state. Callers must
//! drop it whole.

use std::time::{Duration, Instant};

use ghost_replica::PeerId;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ArbitrationError, Result};
use crate::model::{Vec3, WorldStateSnapshot};

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalSource {
    /// World-state producer.
    Generated,
    /// Received from a peer.
    Peer(PeerId),
    /// Produced by this peer (user edits, delegated compute).
    Local,
}

/// Outcome of [`Arbitrator::validate`].
#[derive(Debug)]
pub struct Arbitration {
    pub success: bool,
    /// Stabilized state, present iff `success`.
    pub state: Option<WorldStateSnapshot>,
    pub error: Option<ArbitrationError>,
    /// Soft consistency signal; does not affect `success`.
    pub flagged: Option<String>,
}

impl Arbitration {
    fn accepted(state: WorldStateSnapshot, flagged: Option<String>) -> Self {
        Self {
            success: true,
            state: Some(state),
            error: None,
            flagged,
        }
    }

    fn rejected(error: ArbitrationError) -> Self {
        Self {
            success: false,
            state: None,
            error: Some(error),
            flagged: None,
        }
    }
}

/// Credential-shaped content detector.
#[derive(Debug, Clone)]
pub struct SecurityFilter {
    rules: Vec<(&'static str, Regex)>,
}

impl SecurityFilter {
    /// Rules applied by default.
    pub const DEFAULT_RULES: [(&'static str, &'static str); 8] = [
        ("OPENAI_API_KEY", r"\bsk-[A-Za-z0-9]{20,}\b"),
        ("ANTHROPIC_API_KEY", r"\bsk-ant-[A-Za-z0-9_-]{20,}\b"),
        ("GITHUB_TOKEN", r"\bgh[pous]_[A-Za-z0-9]{30,}\b"),
        ("SLACK_TOKEN", r"\bxox[baprs]-[A-Za-z0-9-]{10,}\b"),
        ("AWS_ACCESS_KEY_ID", r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b"),
        ("BEARER_TOKEN", r"(?i)\bbearer\s+[A-Za-z0-9._-]{20,}\b"),
        ("JWT", r"\beyJ[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\b"),
        ("PRIVATE_KEY", r"-----BEGIN (?:[A-Z]+ )?PRIVATE KEY-----"),
    ];

    /// Compile a rule set.
    pub fn new(rules: &[(&'static str, &str)]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|(id, pattern)| Ok((*id, Regex::new(pattern)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Compile [`DEFAULT_RULES`](Self::DEFAULT_RULES).
    pub fn with_default_rules() -> Result<Self> {
        Self::new(&Self::DEFAULT_RULES)
    }

    /// First rule matching `text`.
    pub fn scan(&self, text: &str) -> Option<&'static str> {
        self.rules
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(id, _)| *id)
    }
}

/// Local view against which peer proposals are judged.
#[derive(Debug, Clone, Copy)]
pub struct Consensus<'a> {
    pub snapshot: &'a WorldStateSnapshot,
    /// 0.0 (no opinion) to 1.0 (authoritative).
    pub confidence: f64,
}

/// Hook for flagging peer states that disagree with local consensus.
pub trait ConsistencyPolicy: Send + Sync {
    /// Return a reason if `proposed` should be flagged.
    fn assess(&self, proposed: &WorldStateSnapshot, consensus: &Consensus<'_>) -> Option<String>;
}

/// Flags proposals whose entity set diverges from a confident local view.
///
/// Divergence is the Jaccard distance between entity id sets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DivergencePolicy {
    pub min_confidence: f64,
    pub max_divergence: f64,
}

impl Default for DivergencePolicy {
    fn default() -> Self {
        Self {
            min_confidence: 0.8,
            max_divergence: 0.5,
        }
    }
}

impl DivergencePolicy {
    /// Jaccard distance between the entity ids of two worlds.
    pub fn divergence(a: &WorldStateSnapshot, b: &WorldStateSnapshot) -> f64 {
        let ids_a: std::collections::HashSet<&str> = a.entities.iter().map(|e| e.id.as_str()).collect();
        let ids_b: std::collections::HashSet<&str> = b.entities.iter().map(|e| e.id.as_str()).collect();
        let union = ids_a.union(&ids_b).count();
        if union == 0 {
            return 0.0;
        }
        let shared = ids_a.intersection(&ids_b).count();
        1.0 - shared as f64 / union as f64
    }
}

impl ConsistencyPolicy for DivergencePolicy {
    fn assess(&self, proposed: &WorldStateSnapshot, consensus: &Consensus<'_>) -> Option<String> {
        if consensus.confidence < self.min_confidence || consensus.snapshot.entities.is_empty() {
            return None;
        }
        let d = Self::divergence(proposed, consensus.snapshot);
        (d > self.max_divergence).then(|| format!("divergence {:.2} exceeds {:.2}", d, self.max_divergence))
    }
}

/// Tuning for the stabilization pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilizationConfig {
    /// Correction frames.
    pub frames: u32,
    /// Wall-clock cap for the whole pass.
    pub budget: Duration,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            frames: 8,
            budget: Duration::from_millis(4),
        }
    }
}

/// Push overlapping spheres apart.
///
/// Each frame resolves every overlapping pair once, splitting the correction
/// by inverse mass. A correction that would leave a position non-finite is
/// skipped. Stops early when nothing overlaps or the budget runs out.
/// Returns the number of frames run.
pub fn stabilize(world: &mut WorldStateSnapshot, config: &StabilizationConfig) -> u32 {
    let started = Instant::now();
    let n = world.entities.len();
    let mut frames = 0;

    while frames < config.frames && started.elapsed() <= config.budget {
        frames += 1;
        let mut moved = false;
        for i in 0..n {
            for j in (i + 1)..n {
                let (a, b) = (&world.entities[i], &world.entities[j]);
                let delta = b.position.sub(a.position);
                let dist = delta.length();
                let overlap = a.radius + b.radius - dist;
                if overlap.is_nan() || overlap <= 0.0 {
                    continue;
                }
                let dir = if dist.is_finite() && dist > f64::EPSILON { delta.scale(1.0 / dist) } else { Vec3::X };
                // Inverse-mass split written as a mass ratio; even split when the sum overflows.
                let total = a.mass + b.mass;
                let share_a = if total.is_finite() && total > 0.0 { b.mass / total } else { 0.5 };
                let share_b = 1.0 - share_a;

                let pa = world.entities[i].position.sub(dir.scale(overlap * share_a));
                let pb = world.entities[j].position.add(dir.scale(overlap * share_b));
                if !(pa.is_finite() && pb.is_finite()) {
                    continue;
                }
                world.entities[i].position = pa;
                world.entities[j].position = pb;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }
    frames
}

/// The validation gate.
pub struct Arbitrator {
    filter: SecurityFilter,
    stabilization: StabilizationConfig,
    consistency: Box<dyn ConsistencyPolicy>,
}

impl Arbitrator {
    /// Arbitrator with default rules and policy.
    pub fn new() -> Result<Self> {
        Ok(Self::with_parts(
            SecurityFilter::with_default_rules()?,
            StabilizationConfig::default(),
            Box::new(DivergencePolicy::default()),
        ))
    }

    pub fn with_parts(
        filter: SecurityFilter,
        stabilization: StabilizationConfig,
        consistency: Box<dyn ConsistencyPolicy>,
    ) -> Self {
        Self {
            filter,
            stabilization,
            consistency,
        }
    }

    /// Validate without a local consensus.
    pub fn validate(&self, proposed: &Value, source: ProposalSource) -> Arbitration {
        self.validate_with(proposed, source, None)
    }

    /// Validate, judging peer proposals against `consensus` if given.
    pub fn validate_with(&self, proposed: &Value, source: ProposalSource, consensus: Option<&Consensus<'_>>) -> Arbitration {
        let mut world: WorldStateSnapshot = match serde_json::from_value(proposed.clone()) {
            Ok(w) => w,
            Err(e) => return self.reject(source, ArbitrationError::SchemaMismatch(e.to_string())),
        };
        if let Err(reason) = world.check() {
            return self.reject(source, ArbitrationError::SchemaMismatch(reason));
        }

        let serialized = proposed.to_string();
        if let Some(rule) = self.filter.scan(&serialized) {
            return self.reject(source, ArbitrationError::SecurityViolation { rule });
        }

        let frames = stabilize(&mut world, &self.stabilization);
        debug!("Stabilized {:?} proposal in {} frames", source, frames);
        if let Err(reason) = world.check() {
            return self.reject(source, ArbitrationError::SchemaMismatch(format!("after stabilization: {}", reason)));
        }

        let flagged = match (source, consensus) {
            (ProposalSource::Peer(peer), Some(consensus)) => {
                let flag = self.consistency.assess(&world, consensus);
                if let Some(reason) = &flag {
                    warn!("Peer {} proposal flagged: {}", peer, reason);
                }
                flag
            }
            _ => None,
        };

        Arbitration::accepted(world, flagged)
    }

    fn reject(&self, source: ProposalSource, error: ArbitrationError) -> Arbitration {
        warn!("Rejected {:?} proposal: {}", source, error);
        Arbitration::rejected(error)
    }
}

impl std::fmt::Debug for Arbitrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arbitrator")
            .field("filter", &self.filter)
            .field("stabilization", &self.stabilization)
            .finish_non_exhaustive()
    }
}
