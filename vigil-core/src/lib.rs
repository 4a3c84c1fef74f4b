//! Cluster membership core: bit-indexed member sets, per-peer heartbeat protocols, failure
//! detection, gossip dissemination and leader election over stable views.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

/// Wall-clock helpers; every protocol time is milliseconds since the Unix epoch.
pub mod clock;
/// Declarative configuration schema shared by the CLI and runtime.
pub mod config;
/// Per-peer connection bundles, aggregate view computation and notifications.
pub mod connection;
/// Failure detectors (phi-accrual and adaptive).
pub mod detector;
/// Leader election votes and tallies.
pub mod election;
/// Error types surfaced by the membership runtime.
pub mod error;
/// Push-pull gossip of heartbeat digests.
pub mod gossip;
/// Node identity within a cluster.
pub mod identity;
/// Bit-indexed membership sets.
pub mod member_set;
/// Per-connection heartbeat and view state machine.
pub mod protocol;
/// Seed, live and unreachable peer tracking.
pub mod registry;
/// Background tasks driving a manager over a transport.
pub mod runtime;
/// Message transport seam and its UDP implementation.
pub mod transport;
/// Membership views and heartbeat records.
pub mod view;

pub use config::{
    AdaptiveConfig, ClusterConfig, DetectorConfig, GossipConfig, HeartbeatConfig,
    PhiAccrualConfig, RegistryConfig,
};
pub use connection::{
    ClusterEvent, ConnectionManager, MembershipListener, MembershipStats, PeerSnapshot,
    SweepReport,
};
pub use detector::{AdaptiveDetector, FailureDetector, PhiAccrualDetector};
pub use election::{Candidate, LeaderElection, Participant, Tally};
pub use error::ClusterError;
pub use gossip::{Digest, GossipEngine, GossipMessage, RoundReport};
pub use identity::Identity;
pub use member_set::{MAX_ID, MemberIdSet};
pub use protocol::{HeartbeatOutcome, ProtocolState, ViewProtocol};
pub use registry::{Admission, PeerRegistry, PeerStatus, RegistryEntry};
pub use runtime::{ClusterHandle, ClusterRuntime};
pub use transport::{Transport, UdpTransport};
pub use view::{Ballot, HeartbeatRecord, MembershipView};
