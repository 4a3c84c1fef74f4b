use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::clock::Millis;
use crate::connection::ConnectionManager;
use crate::error::ClusterError;
use crate::identity::Identity;
use crate::member_set::{MAX_ID, MemberIdSet};
use crate::transport::{Transport, encoded_len};
use crate::view::{Ballot, HeartbeatRecord, MembershipView};

/// The most recent heartbeat known for one node, with the address it gossips on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    /// Gossip address of `record.sender`.
    pub addr: SocketAddr,
    /// Latest heartbeat produced by that node.
    pub record: HeartbeatRecord,
}

/// Messages exchanged during a push-pull gossip round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipMessage {
    /// Opening push carrying the sender's digests.
    Syn {
        /// Sending node.
        from: Identity,
        /// Sender's own digest first, then relayed peer digests.
        digests: Vec<Digest>,
    },
    /// Pull reply carrying the receiver's digests.
    Ack {
        /// Replying node.
        from: Identity,
        /// Replier's own digest first, then relayed peer digests.
        digests: Vec<Digest>,
    },
}

impl GossipMessage {
    /// Node that produced the message.
    #[must_use]
    pub const fn from(&self) -> Identity {
        match self {
            Self::Syn { from, .. } | Self::Ack { from, .. } => *from,
        }
    }

    /// Digests carried by the message.
    #[must_use]
    pub fn digests(&self) -> &[Digest] {
        match self {
            Self::Syn { digests, .. } | Self::Ack { digests, .. } => digests,
        }
    }
}

/// Encoded size of a message carrying only a local digest whose view has `members` ids.
///
/// Every field is taken at its widest, so the result bounds what any node with that many
/// members produces.
pub fn local_message_size(members: usize) -> Result<usize, ClusterError> {
    let identity = Identity::new(u32::MAX, MAX_ID, u64::MAX);
    let ids: MemberIdSet = (0..=MAX_ID).take(members).collect();
    let message = GossipMessage::Syn {
        from: identity,
        digests: vec![Digest {
            addr: SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, u16::MAX, 0, 0)),
            record: HeartbeatRecord {
                sender: identity,
                view: MembershipView::new(ids),
                heartbeat_time: Millis::MAX,
                view_version: u64::MAX,
                ballot: Ballot {
                    preferred: true,
                    vote: identity,
                },
            },
        }],
    };
    encoded_len(&message)
}

/// Outbound work planned for one gossip round.
#[derive(Debug, Clone)]
pub struct GossipRound {
    /// Randomly selected peers.
    pub targets: Vec<SocketAddr>,
    /// Syn message sent to every target.
    pub message: GossipMessage,
}

/// Summary of a completed round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Targets the Syn was handed to the transport for.
    pub sent: usize,
    /// Targets whose send failed.
    pub failed: usize,
    /// Peers convicted by their failure detector and evicted.
    pub evicted: Vec<Identity>,
}

/// Periodic epidemic dissemination of heartbeat records.
///
/// Each round picks random targets from the peer registry, pushes the freshest records, and
/// evicts every peer whose failure detector convicts it. Inbound records are fed through the
/// [`ConnectionManager`], which updates the per-peer protocol and detector.
pub struct GossipEngine {
    manager: Arc<ConnectionManager>,
    rng: Mutex<SmallRng>,
}

impl GossipEngine {
    /// Creates an engine with an entropy-seeded target selector.
    #[must_use]
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Creates an engine with a deterministic target selector.
    #[must_use]
    pub fn with_seed(manager: Arc<ConnectionManager>, seed: u64) -> Self {
        Self {
            manager,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    /// Manager the engine feeds.
    #[must_use]
    pub const fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Local digest followed by the freshest peer digests that fit.
    ///
    /// At most `gossip.max_digests` digests are returned and their encoded message stays
    /// within `gossip.max_message_size`; a relayed digest that would overflow is skipped in
    /// favour of smaller, older ones. The local digest is always present.
    #[must_use]
    pub fn digests(&self, now: Millis) -> Vec<Digest> {
        let gossip = &self.manager.config().gossip;
        let local = Digest {
            addr: self.manager.local_addr(),
            record: self.manager.local_record(now),
        };
        let envelope = GossipMessage::Syn {
            from: self.manager.local(),
            digests: Vec::new(),
        };
        let mut remaining = gossip
            .max_message_size
            .saturating_sub(encoded_len(&envelope).unwrap_or(usize::MAX))
            .saturating_sub(encoded_len(&local).unwrap_or(usize::MAX));

        let mut digests = vec![local];
        let mut skipped = 0usize;
        for (record, addr) in self.manager.peer_records(gossip.max_digests.saturating_sub(1)) {
            let digest = Digest { addr, record };
            match encoded_len(&digest) {
                Ok(len) if len <= remaining => {
                    remaining -= len;
                    digests.push(digest);
                }
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            trace!(skipped, carried = digests.len(), "digests left out of size budget");
        }
        digests
    }

    /// Selects targets and builds the Syn for one round.
    pub fn plan_round(&self, now: Millis) -> GossipRound {
        let fanout = self.manager.config().gossip.fanout;
        let targets = {
            let mut rng = self.rng.lock();
            self.manager.select_targets(fanout, &mut *rng)
        };
        GossipRound {
            targets,
            message: GossipMessage::Syn {
                from: self.manager.local(),
                digests: self.digests(now),
            },
        }
    }

    /// Applies an inbound message. Returns the Ack to send back when `message` is a Syn from
    /// this cluster.
    ///
    /// A digest refused because the connection table is full only skips that digest.
    pub fn handle_message(
        &self,
        message: &GossipMessage,
        from_addr: SocketAddr,
        now: Millis,
    ) -> Result<Option<(GossipMessage, SocketAddr)>, ClusterError> {
        trace!(from = %message.from(), %from_addr, digests = message.digests().len(), "gossip received");
        for digest in message.digests() {
            match self.manager.receive_heartbeat(&digest.record, digest.addr, now) {
                Ok(_) => {}
                Err(ClusterError::ConnectionLimit { limit }) => {
                    debug!(peer = %digest.record.sender, limit, "skipping digest; connection table full");
                }
                Err(err) => return Err(err),
            }
        }

        match message {
            GossipMessage::Syn { from, .. } if !from.in_cluster(self.manager.config().magic) => {
                Ok(None)
            }
            GossipMessage::Syn { .. } => {
                let reply = GossipMessage::Ack {
                    from: self.manager.local(),
                    digests: self.digests(now),
                };
                Ok(Some((reply, from_addr)))
            }
            GossipMessage::Ack { .. } => Ok(None),
        }
    }

    /// Runs one full round: push to the selected targets, then evict convicted peers.
    ///
    /// Send failures are logged per target and never abort the round.
    pub async fn run_round(&self, transport: &dyn Transport, now: Millis) -> RoundReport {
        let round = self.plan_round(now);
        let mut report = RoundReport::default();
        for target in &round.targets {
            match transport.send(&round.message, *target).await {
                Ok(()) => report.sent += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(%target, "gossip send failed: {err}");
                }
            }
        }

        for identity in self.manager.convicted(now) {
            if let Some(addr) = self.manager.evict(identity, now) {
                transport.release(addr);
                report.evicted.push(identity);
            }
        }
        if !report.evicted.is_empty() {
            debug!(evicted = report.evicted.len(), "gossip round evicted peers");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};

    const MAGIC: u32 = 0x77;

    fn addr(node: u32) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9_000 + (node % 50_000) as u16)
    }

    fn engine(node: u32, seeds: Vec<SocketAddr>) -> GossipEngine {
        let config = ClusterConfig {
            magic: MAGIC,
            ..ClusterConfig::default()
        };
        let manager =
            ConnectionManager::new(Identity::new(MAGIC, node, 1), addr(node), seeds, config)
                .unwrap();
        GossipEngine::with_seed(Arc::new(manager), u64::from(node))
    }

    /// Records every send; refuses sends to `refuse`.
    struct Recording {
        sent: Mutex<Vec<(GossipMessage, SocketAddr)>>,
        released: Mutex<Vec<SocketAddr>>,
        refuse: Option<SocketAddr>,
    }

    impl Recording {
        fn new(refuse: Option<SocketAddr>) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                released: Mutex::new(Vec::new()),
                refuse,
            }
        }
    }

    #[async_trait]
    impl Transport for Recording {
        async fn send(&self, message: &GossipMessage, addr: SocketAddr) -> Result<(), ClusterError> {
            if self.refuse == Some(addr) {
                return Err(ClusterError::MessageTooLarge(0));
            }
            self.sent.lock().push((message.clone(), addr));
            Ok(())
        }

        async fn recv(&self) -> Result<(GossipMessage, SocketAddr), ClusterError> {
            std::future::pending().await
        }

        fn local_addr(&self) -> Result<SocketAddr, ClusterError> {
            Ok(addr(0))
        }

        fn release(&self, addr: SocketAddr) {
            self.released.lock().push(addr);
        }
    }

    #[test]
    fn syn_is_answered_with_ack() {
        let (a, b) = (engine(1, Vec::new()), engine(2, Vec::new()));
        let syn = a.plan_round(1_000).message;
        let (reply, to) = b.handle_message(&syn, addr(1), 1_000).unwrap().unwrap();
        assert_eq!(to, addr(1));
        assert!(matches!(reply, GossipMessage::Ack { from, .. } if from.node == 2));
        assert_eq!(reply.digests()[0].record.sender.node, 2);
        assert_eq!(reply.digests()[1].record.sender.node, 1);

        assert!(a.handle_message(&reply, addr(2), 1_000).unwrap().is_none());
        assert!(a.manager().view().members().contains(2));
    }

    #[test]
    fn foreign_syn_gets_no_reply() {
        let local = engine(1, Vec::new());
        let mut syn = engine(2, Vec::new()).plan_round(1_000).message;
        if let GossipMessage::Syn { from, digests } = &mut syn {
            from.magic = MAGIC + 1;
            digests[0].record.sender.magic = MAGIC + 1;
        }
        assert!(local.handle_message(&syn, addr(2), 1_000).unwrap().is_none());
        assert_eq!(local.manager().stats().foreign_dropped, 1);
    }

    #[test]
    fn third_party_records_are_relayed() {
        let (a, b, c) = (
            engine(1, Vec::new()),
            engine(2, Vec::new()),
            engine(3, Vec::new()),
        );
        let from_c = c.plan_round(1_000).message;
        b.handle_message(&from_c, addr(3), 1_000).unwrap();

        let from_b = b.plan_round(1_100).message;
        a.handle_message(&from_b, addr(2), 1_100).unwrap();
        let members: Vec<_> = a.manager().view().members().iter().collect();
        assert_eq!(members, vec![1, 2, 3]);
    }

    #[test]
    fn digests_are_capped() {
        let hub = engine(1, Vec::new());
        for node in 2..=20 {
            let syn = engine(node, Vec::new()).plan_round(1_000).message;
            hub.handle_message(&syn, addr(node), 1_000).unwrap();
        }
        let digests = hub.digests(1_100);
        assert_eq!(digests.len(), hub.manager().config().gossip.max_digests);
        assert_eq!(digests[0].record.sender.node, 1);
    }

    #[test]
    fn high_node_ids_fit_in_one_datagram() {
        let (low, high, top) = (
            engine(1, Vec::new()),
            engine(5_000, Vec::new()),
            engine(MAX_ID, Vec::new()),
        );
        let from_high = high.plan_round(1_000).message;
        low.handle_message(&from_high, addr(2), 1_000).unwrap();
        let from_top = top.plan_round(1_000).message;
        low.handle_message(&from_top, addr(3), 1_000).unwrap();

        let syn = low.plan_round(1_100).message;
        assert_eq!(syn.digests().len(), 3);
        assert!(encoded_len(&syn).unwrap() <= low.manager().config().gossip.max_message_size);

        let (ack, _) = high.handle_message(&syn, addr(1), 1_100).unwrap().unwrap();
        assert!(encoded_len(&ack).unwrap() <= 1_400);
        let members: Vec<_> = high.manager().view().members().iter().collect();
        assert_eq!(members, vec![1, 5_000, MAX_ID]);
    }

    #[test]
    fn relayed_digests_respect_the_size_budget() {
        let mut config = ClusterConfig {
            magic: MAGIC,
            max_connections: 16,
            ..ClusterConfig::default()
        };
        config.gossip.max_message_size = 400;
        let manager =
            ConnectionManager::new(Identity::new(MAGIC, 1, 1), addr(1), Vec::new(), config).unwrap();
        let hub = GossipEngine::with_seed(Arc::new(manager), 1);
        for node in 2..=12 {
            let syn = engine(node, Vec::new()).plan_round(1_000).message;
            hub.handle_message(&syn, addr(node), 1_000).unwrap();
        }

        let syn = hub.plan_round(1_100).message;
        assert!(encoded_len(&syn).unwrap() <= 400);
        assert_eq!(syn.digests()[0].record.sender.node, 1);
        assert!(syn.digests().len() > 1);
        assert!(syn.digests().len() < hub.manager().config().gossip.max_digests);
    }

    #[test]
    fn local_message_bound_covers_real_messages() {
        let hub = engine(MAX_ID, Vec::new());
        for node in 1..=6 {
            let syn = engine(node, Vec::new()).plan_round(1_000).message;
            hub.handle_message(&syn, addr(node), 1_000).unwrap();
        }
        let local_only = GossipMessage::Syn {
            from: hub.manager().local(),
            digests: vec![hub.digests(1_100).remove(0)],
        };
        assert!(encoded_len(&local_only).unwrap() <= local_message_size(7).unwrap());
    }

    #[tokio::test]
    async fn round_sends_to_seed_and_survives_failures() {
        let lonely = engine(1, vec![addr(50)]);
        let transport = Recording::new(None);
        let report = lonely.run_round(&transport, 1_000).await;
        assert_eq!(report.sent, 1);
        assert_eq!(transport.sent.lock()[0].1, addr(50));

        let failing = Recording::new(Some(addr(50)));
        let report = lonely.run_round(&failing, 1_500).await;
        assert_eq!((report.sent, report.failed), (0, 1));
    }

    #[tokio::test]
    async fn round_evicts_convicted_peers() {
        let (a, b) = (engine(1, Vec::new()), engine(2, Vec::new()));
        for tick in 0..10 {
            let now = 1_000 + tick * 500;
            b.manager().heartbeat(now);
            let syn = b.plan_round(now).message;
            a.handle_message(&syn, addr(2), now).unwrap();
        }
        let transport = Recording::new(None);
        let report = a.run_round(&transport, 120_000).await;
        assert_eq!(report.evicted, vec![b.manager().local()]);
        assert_eq!(*transport.released.lock(), vec![addr(2)]);
        assert!(!a.manager().view().members().contains(2));
    }
}
