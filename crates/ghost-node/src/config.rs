//! Node configuration.
//!
//! Every tunable has a default; `GHOST_*` environment variables override
//! them. The power and consensus thresholds are heuristics, so they live
//! here rather than in code.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use ghost_consensus::{DeviceProfile, PowerThresholds, HEARTBEAT_PERIOD, SILENCE_PERIODS};
use ghost_protocols::{INBOUND_FLUSH_INTERVAL, OUTBOUND_MIN_INTERVAL};
use ghost_replica::DEFAULT_EPHEMERAL_CAP;
use ghost_world::{DivergencePolicy, StabilizationConfig};

use crate::error::{Error, Result};

/// Configuration for a Ghost node.
#[derive(Debug, Clone)]
pub struct GhostConfig {
    /// Room to join
    pub room: String,

    /// Operator-supplied relay, tried before the public list
    pub operator_relay: Option<String>,

    /// Public signaling relays, in preference order
    pub relays: Vec<String>,

    /// Listen address for the `ghost-relay` binary
    pub relay_listen_addr: SocketAddr,

    pub heartbeat_period: Duration,

    /// Heartbeat periods of silence before a peer is purged
    pub silence_periods: u32,

    pub outbound_interval: Duration,
    pub inbound_interval: Duration,

    /// Delay between join retries in local-sovereignty mode
    pub rejoin_interval: Duration,

    /// Per-relay handshake timeout
    pub handshake_timeout: Duration,

    pub ephemeral_cap: usize,

    /// This device
    pub device: DeviceProfile,
    pub power_thresholds: PowerThresholds,

    pub stabilization: StabilizationConfig,
    pub divergence: DivergencePolicy,
}

impl Default for GhostConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            room: "ghost-lobby".to_string(),
            operator_relay: None,
            relays: vec!["127.0.0.1:9400".to_string()],
            relay_listen_addr: SocketAddr::from(([0, 0, 0, 0], 9400)),
            heartbeat_period: HEARTBEAT_PERIOD,
            silence_periods: SILENCE_PERIODS,
            outbound_interval: OUTBOUND_MIN_INTERVAL,
            inbound_interval: INBOUND_FLUSH_INTERVAL,
            rejoin_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(3),
            ephemeral_cap: DEFAULT_EPHEMERAL_CAP,
            device: DeviceProfile {
                cores,
                memory_gb: 8.0,
            },
            power_thresholds: PowerThresholds::default(),
            stabilization: StabilizationConfig::default(),
            divergence: DivergencePolicy::default(),
        }
    }
}

impl GhostConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let env = Env { lookup: &lookup };

        let relays = match env.raw("GHOST_RELAYS") {
            Some(list) => list
                .split(',')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
            None => d.relays,
        };

        Ok(Self {
            room: env.raw("GHOST_ROOM").unwrap_or(d.room),
            operator_relay: env.raw("GHOST_OPERATOR_RELAY").filter(|r| !r.trim().is_empty()),
            relays,
            relay_listen_addr: env.parse("GHOST_RELAY_ADDR", d.relay_listen_addr)?,
            heartbeat_period: env.period("GHOST_HEARTBEAT_MS", d.heartbeat_period)?,
            silence_periods: env.parse("GHOST_SILENCE_PERIODS", d.silence_periods)?,
            outbound_interval: env.period("GHOST_OUTBOUND_MS", d.outbound_interval)?,
            inbound_interval: env.period("GHOST_INBOUND_MS", d.inbound_interval)?,
            rejoin_interval: env.period("GHOST_REJOIN_MS", d.rejoin_interval)?,
            handshake_timeout: env.period("GHOST_HANDSHAKE_MS", d.handshake_timeout)?,
            ephemeral_cap: env.parse("GHOST_EPHEMERAL_CAP", d.ephemeral_cap)?,
            device: DeviceProfile {
                cores: env.parse("GHOST_DEVICE_CORES", d.device.cores)?,
                memory_gb: env.parse("GHOST_DEVICE_MEMORY_GB", d.device.memory_gb)?,
            },
            power_thresholds: PowerThresholds {
                min_cores: env.parse("GHOST_MIN_CORES", d.power_thresholds.min_cores)?,
                min_memory_gb: env.parse("GHOST_MIN_MEMORY_GB", d.power_thresholds.min_memory_gb)?,
            },
            stabilization: StabilizationConfig {
                frames: env.parse("GHOST_STABILIZE_FRAMES", d.stabilization.frames)?,
                budget: env.millis("GHOST_STABILIZE_BUDGET_MS", d.stabilization.budget)?,
            },
            divergence: DivergencePolicy {
                min_confidence: env.parse("GHOST_CONSENSUS_MIN_CONFIDENCE", d.divergence.min_confidence)?,
                max_divergence: env.parse("GHOST_MAX_DIVERGENCE", d.divergence.max_divergence)?,
            },
        })
    }

    /// Relays in the order they are raced: operator first, then the list.
    pub fn relay_endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.operator_relay.iter().cloned().collect();
        for relay in &self.relays {
            if !endpoints.contains(relay) {
                endpoints.push(relay.clone());
            }
        }
        endpoints
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn parse<T: FromStr>(&self, name: &str, default: T) -> Result<T> {
        match self.raw(name) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid {}: {:?}", name, raw))),
            None => Ok(default),
        }
    }

    fn millis(&self, name: &str, default: Duration) -> Result<Duration> {
        match self.raw(name) {
            Some(_) => self.parse::<u64>(name, 0).map(Duration::from_millis),
            None => Ok(default),
        }
    }

    /// A timer period: like [`millis`](Self::millis) but zero is rejected.
    fn period(&self, name: &str, default: Duration) -> Result<Duration> {
        let period = self.millis(name, default)?;
        if period.is_zero() {
            return Err(Error::Config(format!("{} must be greater than zero", name)));
        }
        Ok(period)
    }
}
