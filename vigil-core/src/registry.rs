use std::collections::HashMap;
use std::net::SocketAddr;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{Millis, duration_millis};
use crate::config::RegistryConfig;
use crate::identity::Identity;

/// Reachability state of a tracked peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Believed up.
    Live,
    /// Suspected down and quarantined.
    Unreachable,
}

/// Outcome of presenting a heartbeat sender to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The peer is live. `new` is set when it just became live.
    Live {
        /// Whether the peer was not live before this call.
        new: bool,
    },
    /// The peer is unreachable and its quarantine has not elapsed.
    Quarantined,
    /// The heartbeat is no newer than the one seen before the peer was marked unreachable.
    Stale,
}

#[derive(Debug, Clone)]
struct LivePeer {
    identity: Identity,
    addr: SocketAddr,
}

#[derive(Debug, Clone)]
struct UnreachablePeer {
    identity: Identity,
    addr: SocketAddr,
    quarantine_until: Millis,
    forget_at: Millis,
    last_heartbeat: Option<Millis>,
}

/// Diagnostic view of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Peer identity.
    pub identity: Identity,
    /// Gossip address.
    pub addr: SocketAddr,
    /// Current status.
    pub status: PeerStatus,
}

/// Tracks seed, live and unreachable peers and picks gossip targets.
///
/// An unreachable peer stays excluded for `quarantine_delay` and stays tracked for
/// `unreachable_node_delay`, so late duplicate gossip cannot resurrect it.
#[derive(Debug)]
pub struct PeerRegistry {
    quarantine_delay: Millis,
    unreachable_delay: Millis,
    seeds: Vec<SocketAddr>,
    live: HashMap<u32, LivePeer>,
    unreachable: HashMap<u32, UnreachablePeer>,
}

impl PeerRegistry {
    /// Creates a registry seeded with bootstrap addresses. `local_addr` is filtered out.
    #[must_use]
    pub fn new(config: &RegistryConfig, seeds: Vec<SocketAddr>, local_addr: SocketAddr) -> Self {
        let mut seeds = seeds;
        seeds.retain(|seed| *seed != local_addr);
        seeds.sort_unstable();
        seeds.dedup();
        Self {
            quarantine_delay: duration_millis(config.quarantine_delay),
            unreachable_delay: duration_millis(config.unreachable_node_delay),
            seeds,
            live: HashMap::new(),
            unreachable: HashMap::new(),
        }
    }

    /// Presents a heartbeat sender, promoting it to live when allowed.
    pub fn admit(
        &mut self,
        identity: Identity,
        addr: SocketAddr,
        heartbeat_time: Millis,
        now: Millis,
    ) -> Admission {
        if let Some(entry) = self.unreachable.get(&identity.node) {
            if now < entry.quarantine_until {
                return Admission::Quarantined;
            }
            let same_incarnation = identity.epoch <= entry.identity.epoch;
            if same_incarnation
                && entry
                    .last_heartbeat
                    .is_some_and(|last| heartbeat_time <= last)
            {
                return Admission::Stale;
            }
            debug!(peer = %identity, "quarantine elapsed; peer eligible again");
            self.unreachable.remove(&identity.node);
        }

        match self.live.get_mut(&identity.node) {
            Some(peer) => {
                if identity.epoch >= peer.identity.epoch {
                    peer.identity = identity;
                    peer.addr = addr;
                }
                Admission::Live { new: false }
            }
            None => {
                self.live.insert(identity.node, LivePeer { identity, addr });
                Admission::Live { new: true }
            }
        }
    }

    /// Moves a peer to the unreachable set, starting its quarantine.
    pub fn mark_unreachable(
        &mut self,
        identity: Identity,
        last_heartbeat: Option<Millis>,
        now: Millis,
    ) {
        let addr = match self.live.remove(&identity.node) {
            Some(peer) => peer.addr,
            None => match self.unreachable.get(&identity.node) {
                Some(existing) => existing.addr,
                None => return,
            },
        };
        info!(peer = %identity, "peer marked unreachable");
        self.unreachable.insert(
            identity.node,
            UnreachablePeer {
                identity,
                addr,
                quarantine_until: now.saturating_add(self.quarantine_delay),
                forget_at: now.saturating_add(self.unreachable_delay),
                last_heartbeat,
            },
        );
    }

    /// Drops unreachable peers whose tracking window has elapsed.
    pub fn forget_expired(&mut self, now: Millis) -> Vec<Identity> {
        let expired: Vec<_> = self
            .unreachable
            .values()
            .filter(|entry| entry.forget_at <= now)
            .map(|entry| entry.identity)
            .collect();
        for identity in &expired {
            debug!(peer = %identity, "forgetting unreachable peer");
            self.unreachable.remove(&identity.node);
        }
        expired
    }

    /// Picks gossip targets for one round.
    ///
    /// Up to `fanout` live peers are chosen at random. An unreachable peer is probed with
    /// probability `unreachable / (live + 1)` and a seed is probed when no live peer was
    /// picked from the seed list, so a partitioned cluster can heal.
    pub fn select_targets<R: Rng>(&self, fanout: usize, rng: &mut R) -> Vec<SocketAddr> {
        let mut targets: Vec<SocketAddr> = self.live.values().map(|peer| peer.addr).collect();
        targets.shuffle(rng);
        targets.truncate(fanout);

        if !self.unreachable.is_empty() {
            let probability = self.unreachable.len() as f64 / (self.live.len() + 1) as f64;
            if rng.gen_bool(probability.clamp(0.0, 1.0)) {
                let pool: Vec<_> = self.unreachable.values().map(|peer| peer.addr).collect();
                if let Some(addr) = pool.choose(rng) {
                    targets.push(*addr);
                }
            }
        }

        let contacted_seed = targets.iter().any(|addr| self.seeds.contains(addr));
        if !self.seeds.is_empty() && !contacted_seed {
            let probability = if self.live.is_empty() {
                1.0
            } else {
                self.seeds.len() as f64 / (self.live.len() + self.unreachable.len()) as f64
            };
            if rng.gen_bool(probability.clamp(0.0, 1.0)) {
                if let Some(seed) = self.seeds.choose(rng) {
                    targets.push(*seed);
                }
            }
        }

        targets.sort_unstable();
        targets.dedup();
        targets
    }

    /// Current status of `node`, if tracked.
    #[must_use]
    pub fn status(&self, node: u32) -> Option<PeerStatus> {
        if self.live.contains_key(&node) {
            Some(PeerStatus::Live)
        } else if self.unreachable.contains_key(&node) {
            Some(PeerStatus::Unreachable)
        } else {
            None
        }
    }

    /// Gossip address of a tracked peer.
    #[must_use]
    pub fn addr_of(&self, node: u32) -> Option<SocketAddr> {
        self.live
            .get(&node)
            .map(|peer| peer.addr)
            .or_else(|| self.unreachable.get(&node).map(|peer| peer.addr))
    }

    /// Identities of live peers.
    #[must_use]
    pub fn live_peers(&self) -> Vec<Identity> {
        self.live.values().map(|peer| peer.identity).collect()
    }

    /// Bootstrap addresses.
    #[must_use]
    pub fn seeds(&self) -> &[SocketAddr] {
        &self.seeds
    }

    /// Number of live peers.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Number of unreachable peers still tracked.
    #[must_use]
    pub fn unreachable_count(&self) -> usize {
        self.unreachable.len()
    }

    /// Every tracked entry, for diagnostics.
    #[must_use]
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let live = self.live.values().map(|peer| RegistryEntry {
            identity: peer.identity,
            addr: peer.addr,
            status: PeerStatus::Live,
        });
        let unreachable = self.unreachable.values().map(|peer| RegistryEntry {
            identity: peer.identity,
            addr: peer.addr,
            status: PeerStatus::Unreachable,
        });
        let mut entries: Vec<_> = live.chain(unreachable).collect();
        entries.sort_unstable_by_key(|entry| entry.identity);
        entries
    }
}
