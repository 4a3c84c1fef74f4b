use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::gossip;
use crate::member_set::MAX_ID;
use crate::transport::MAX_DATAGRAM_SIZE;

/// Top-level configuration for a membership node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster fence value; heartbeats carrying a different magic are dropped.
    pub magic: u32,
    /// Local node identifier (bit index into membership sets).
    pub node_id: u32,
    /// Whether this node should win leader elections whenever it is present.
    pub preferred_leader: bool,
    /// Address the gossip transport binds to.
    pub bind: String,
    /// Optional externally reachable address advertised to peers.
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,
    /// `[host]:[port]` endpoints contacted during startup.
    pub seeds: Vec<String>,
    /// Heartbeat cadence and connection timeouts.
    pub heartbeat: HeartbeatConfig,
    /// Gossip round tuning.
    pub gossip: GossipConfig,
    /// Failure detector selection and parameters.
    pub detector: DetectorConfig,
    /// Quarantine timing for unreachable peers.
    pub registry: RegistryConfig,
    /// Maximum number of concurrent peer connections.
    pub max_connections: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            magic: 0x5647_494c,
            node_id: 0,
            preferred_leader: false,
            bind: "0.0.0.0:7946".to_string(),
            advertise_addr: None,
            seeds: Vec::new(),
            heartbeat: HeartbeatConfig::default(),
            gossip: GossipConfig::default(),
            detector: DetectorConfig::default(),
            registry: RegistryConfig::default(),
            max_connections: 256,
        }
    }
}

impl ClusterConfig {
    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.node_id > MAX_ID {
            return Err(ClusterError::Configuration(format!(
                "node_id {} exceeds the maximum of {MAX_ID}",
                self.node_id
            )));
        }
        if self.bind.trim().is_empty() {
            return Err(ClusterError::Configuration("bind address is empty".into()));
        }
        if self.max_connections == 0 {
            return Err(ClusterError::Configuration(
                "max_connections must be positive".into(),
            ));
        }
        self.heartbeat.validate()?;
        self.gossip.validate()?;
        let members = self.max_connections.saturating_add(1);
        let needed = gossip::local_message_size(members)?;
        if needed > self.gossip.max_message_size {
            return Err(ClusterError::Configuration(format!(
                "gossip.max_message_size {} cannot carry a local digest of {members} members \
                 ({needed} bytes); lower max_connections or raise the limit",
                self.gossip.max_message_size
            )));
        }
        self.detector.validate()?;
        self.registry.validate()
    }

    /// Parses the bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ClusterError> {
        SocketAddr::from_str(self.bind.trim()).map_err(|err| {
            ClusterError::Configuration(format!("invalid bind address '{}': {err}", self.bind))
        })
    }

    /// Resolves every seed entry into a socket address.
    pub fn resolve_seeds(&self) -> Result<Vec<SocketAddr>, ClusterError> {
        self.seeds.iter().map(|seed| resolve_seed(seed)).collect()
    }
}

fn resolve_seed(seed: &str) -> Result<SocketAddr, ClusterError> {
    if let Ok(parsed) = SocketAddr::from_str(seed) {
        return Ok(parsed);
    }
    let mut resolved = seed
        .to_socket_addrs()
        .map_err(|source| ClusterError::InvalidSeed {
            addr: seed.to_string(),
            source,
        })?;
    resolved.next().ok_or_else(|| ClusterError::InvalidSeed {
        addr: seed.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
    })
}

/// Heartbeat cadence and per-connection timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between local heartbeat ticks.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Bound beyond which a connection is no longer timely and is flagged suspect.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Silence after which a connection is torn down. Must exceed twice `timeout`.
    #[serde(with = "humantime_serde")]
    pub quiesce_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(5),
            quiesce_timeout: Duration::from_secs(15),
        }
    }
}

impl HeartbeatConfig {
    fn validate(&self) -> Result<(), ClusterError> {
        if self.interval.is_zero() {
            return Err(ClusterError::Configuration(
                "heartbeat.interval must be positive".into(),
            ));
        }
        if self.timeout <= self.interval {
            return Err(ClusterError::Configuration(
                "heartbeat.timeout must exceed heartbeat.interval".into(),
            ));
        }
        if self.quiesce_timeout <= self.timeout * 2 {
            return Err(ClusterError::Configuration(
                "heartbeat.quiesce_timeout must exceed twice heartbeat.timeout".into(),
            ));
        }
        Ok(())
    }
}

/// Gossip round tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Interval between gossip rounds.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Live peers contacted per round.
    pub fanout: usize,
    /// Maximum heartbeat digests carried per message.
    pub max_digests: usize,
    /// Encoded size limit for one gossip datagram, in bytes.
    pub max_message_size: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            fanout: 3,
            max_digests: 8,
            max_message_size: 1_400,
        }
    }
}

impl GossipConfig {
    fn validate(&self) -> Result<(), ClusterError> {
        if self.interval.is_zero() {
            return Err(ClusterError::Configuration(
                "gossip.interval must be positive".into(),
            ));
        }
        if self.fanout == 0 || self.max_digests == 0 {
            return Err(ClusterError::Configuration(
                "gossip.fanout and gossip.max_digests must be positive".into(),
            ));
        }
        if self.max_message_size == 0 || self.max_message_size > MAX_DATAGRAM_SIZE {
            return Err(ClusterError::Configuration(format!(
                "gossip.max_message_size must lie in 1..={MAX_DATAGRAM_SIZE}"
            )));
        }
        Ok(())
    }
}

/// Failure detector algorithm and parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum DetectorConfig {
    /// Phi-accrual detector.
    Phi(PhiAccrualConfig),
    /// Adaptive (EWMA) detector.
    Adaptive(AdaptiveConfig),
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::Phi(PhiAccrualConfig::default())
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<(), ClusterError> {
        match self {
            Self::Phi(phi) => {
                if !(phi.threshold.is_finite() && phi.threshold > 0.0) || phi.max_samples == 0 {
                    return Err(ClusterError::Configuration(
                        "phi detector needs a positive threshold and window".into(),
                    ));
                }
            }
            Self::Adaptive(adaptive) => {
                if !(adaptive.smoothing > 0.0 && adaptive.smoothing <= 1.0) {
                    return Err(ClusterError::Configuration(
                        "adaptive.smoothing must lie in (0, 1]".into(),
                    ));
                }
                if !(adaptive.multiplier.is_finite() && adaptive.multiplier > 0.0) {
                    return Err(ClusterError::Configuration(
                        "adaptive.multiplier must be positive".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Phi-accrual parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhiAccrualConfig {
    /// Suspicion level above which a peer is convicted.
    pub threshold: f64,
    /// Number of intervals retained in the sliding window.
    pub max_samples: usize,
    /// Floor for the fitted standard deviation.
    #[serde(with = "humantime_serde")]
    pub min_std_deviation: Duration,
    /// Extra silence tolerated on top of the mean interval.
    #[serde(with = "humantime_serde")]
    pub acceptable_pause: Duration,
    /// Interval assumed before any has been observed.
    #[serde(with = "humantime_serde")]
    pub first_heartbeat_estimate: Duration,
}

impl Default for PhiAccrualConfig {
    fn default() -> Self {
        Self {
            threshold: 8.0,
            max_samples: 1_000,
            min_std_deviation: Duration::from_millis(100),
            acceptable_pause: Duration::ZERO,
            first_heartbeat_estimate: Duration::from_millis(500),
        }
    }
}

/// Adaptive detector parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// EWMA smoothing factor in `(0, 1]`.
    pub smoothing: f64,
    /// Standard deviations of silence tolerated above the mean.
    pub multiplier: f64,
    /// Intervals required before conviction is allowed.
    pub min_samples: usize,
    /// Floor for the smoothed standard deviation.
    #[serde(with = "humantime_serde")]
    pub min_std_deviation: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            smoothing: 0.1,
            multiplier: 4.0,
            min_samples: 10,
            min_std_deviation: Duration::from_millis(50),
        }
    }
}

/// Quarantine timing for the peer registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Minimum time an unreachable peer stays excluded before it may become live again.
    #[serde(with = "humantime_serde")]
    pub quarantine_delay: Duration,
    /// Time an unreachable peer stays tracked before it is forgotten.
    #[serde(with = "humantime_serde")]
    pub unreachable_node_delay: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            quarantine_delay: Duration::from_secs(10),
            unreachable_node_delay: Duration::from_secs(60),
        }
    }
}

impl RegistryConfig {
    fn validate(&self) -> Result<(), ClusterError> {
        if self.unreachable_node_delay < self.quarantine_delay {
            return Err(ClusterError::Configuration(
                "registry.unreachable_node_delay must not be shorter than quarantine_delay".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ClusterConfig::default().validate().unwrap();
    }

    #[test]
    fn quiesce_must_exceed_twice_timeout() {
        let mut config = ClusterConfig::default();
        config.heartbeat.quiesce_timeout = config.heartbeat.timeout * 2;
        assert!(matches!(
            config.validate(),
            Err(ClusterError::Configuration(_))
        ));
    }

    #[test]
    fn local_digest_must_fit_in_a_datagram() {
        let mut config = ClusterConfig {
            max_connections: 1_024,
            ..ClusterConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ClusterError::Configuration(message)) if message.contains("max_message_size")
        ));

        config.gossip.max_message_size = 8_192;
        config.validate().unwrap();

        config.gossip.max_message_size = 70_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_smoothing() {
        let config = ClusterConfig {
            detector: DetectorConfig::Adaptive(AdaptiveConfig {
                smoothing: 1.5,
                ..AdaptiveConfig::default()
            }),
            ..ClusterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn seeds_resolve_literal_and_hostnames() {
        let config = ClusterConfig {
            seeds: vec!["127.0.0.1:7000".into(), "localhost:7001".into()],
            ..ClusterConfig::default()
        };
        let seeds = config.resolve_seeds().unwrap();
        assert_eq!(seeds[0].port(), 7000);
        assert_eq!(seeds[1].port(), 7001);
    }

    #[test]
    fn invalid_seed_is_reported() {
        let config = ClusterConfig {
            seeds: vec!["not a seed".into()],
            ..ClusterConfig::default()
        };
        assert!(matches!(
            config.resolve_seeds(),
            Err(ClusterError::InvalidSeed { .. })
        ));
    }
}
