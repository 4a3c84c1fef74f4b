use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::clock::Millis;
use crate::config::ClusterConfig;
use crate::detector::FailureDetector;
use crate::election::{Candidate, LeaderElection, Participant, choose_vote};
use crate::error::ClusterError;
use crate::identity::Identity;
use crate::member_set::{MAX_ID, MemberIdSet};
use crate::protocol::{HeartbeatOutcome, ViewProtocol};
use crate::registry::{Admission, PeerRegistry, RegistryEntry};
use crate::view::{Ballot, HeartbeatRecord, MembershipView};

/// Application-facing membership notifications.
pub trait MembershipListener: Send + Sync {
    /// A new stable view was agreed on and `leader` was elected for it.
    fn on_view_change(&self, view: &MembershipView, leader: Identity);

    /// The stable view's logical timestamp moved without a membership change.
    fn on_view_time_change(&self, _view: &MembershipView) {}
}

/// Notification published to [`ConnectionManager::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A new stable view and its leader.
    ViewChanged {
        /// The stable aggregate view.
        view: MembershipView,
        /// Elected leader.
        leader: Identity,
    },
    /// Time-only update of the current stable view.
    ViewTimeChanged {
        /// The stable aggregate view.
        view: MembershipView,
    },
}

/// Aggregate membership statistics for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MembershipStats {
    /// Peers believed up.
    pub live: usize,
    /// Peers quarantined as unreachable.
    pub unreachable: usize,
    /// Bootstrap seed addresses.
    pub seeds: usize,
    /// Open per-peer connections.
    pub connections: usize,
    /// Heartbeats dropped because of a cluster magic mismatch.
    pub foreign_dropped: u64,
    /// Heartbeats dropped as stale or duplicate.
    pub stale_dropped: u64,
}

/// Immutable view of a peer connection used for diagnostics.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    /// Remote identity.
    pub identity: Identity,
    /// Gossip address.
    pub addr: SocketAddr,
    /// Remote time of the last accepted heartbeat.
    pub last_heartbeat: Option<Millis>,
    /// Remote view version.
    pub view_version: u64,
    /// Whether the sweep flagged the connection as not timely.
    pub suspected: bool,
    /// Detector algorithm label.
    pub detector: &'static str,
    /// Intervals learned by the detector.
    pub intervals: usize,
}

/// Result of one connection sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections flagged suspect to their failure detector.
    pub suspected: Vec<Identity>,
    /// Quiesced connections that were removed, with the address to release.
    pub removed: Vec<(Identity, SocketAddr)>,
    /// Unreachable peers whose tracking window ended.
    pub forgotten: Vec<Identity>,
}

/// Per-peer state bundle, always accessed under its own lock.
struct PeerConnection {
    identity: Identity,
    addr: SocketAddr,
    protocol: ViewProtocol,
    detector: FailureDetector,
    candidate: Candidate,
    latest: Option<HeartbeatRecord>,
    suspected: bool,
}

impl PeerConnection {
    fn new(identity: Identity, addr: SocketAddr, config: &ClusterConfig) -> Self {
        Self {
            identity,
            addr,
            protocol: ViewProtocol::new(identity),
            detector: FailureDetector::from_config(&config.detector),
            candidate: Candidate::default(),
            latest: None,
            suspected: false,
        }
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            identity: self.identity,
            addr: self.addr,
            last_heartbeat: self.protocol.last_heartbeat(),
            view_version: self.protocol.view_version(),
            suspected: self.suspected,
            detector: self.detector.algorithm(),
            intervals: self.detector.interval_count(),
        }
    }
}

/// What the aggregate evaluation needs from one connection, copied out under its lock.
struct ConnectionView {
    identity: Identity,
    view: MembershipView,
    candidate: Candidate,
}

/// Aggregate cluster state guarded by a single coarse lock.
struct ClusterView {
    view: MembershipView,
    version: u64,
    election: LeaderElection,
    local_record: Option<HeartbeatRecord>,
}

/// Owns every per-peer bundle (protocol, detector, candidate), the peer registry and the
/// aggregate cluster view.
///
/// Locking: each connection has its own mutex and the registry and aggregate view each have
/// one coarse lock. None of these is held while taking another; a connection mutex may only
/// be taken under the map shard that owns it, and the event outbox only under the aggregate
/// lock. Cross-connection work copies what it needs out of each connection first and then
/// takes the aggregate lock.
///
/// Events are queued in the order the aggregate view produced them and delivered by one
/// thread at a time. A listener may call back into the manager, but events raised from inside
/// a callback are delivered after it returns.
pub struct ConnectionManager {
    local: Identity,
    local_addr: SocketAddr,
    config: ClusterConfig,
    connections: DashMap<u32, Arc<Mutex<PeerConnection>>>,
    registry: RwLock<PeerRegistry>,
    cluster: Mutex<ClusterView>,
    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
    events_tx: broadcast::Sender<ClusterEvent>,
    outbox: Mutex<VecDeque<ClusterEvent>>,
    dispatch: Mutex<()>,
    terminated: AtomicBool,
    foreign_dropped: AtomicU64,
    stale_dropped: AtomicU64,
}

impl ConnectionManager {
    /// Builds a manager for `local`, advertised at `local_addr`.
    pub fn new(
        local: Identity,
        local_addr: SocketAddr,
        seeds: Vec<SocketAddr>,
        config: ClusterConfig,
    ) -> Result<Self, ClusterError> {
        config.validate()?;
        if local.node > MAX_ID {
            return Err(ClusterError::Configuration(format!(
                "local node id {} exceeds {MAX_ID}",
                local.node
            )));
        }
        let registry = PeerRegistry::new(&config.registry, seeds, local_addr);
        let mut members = MemberIdSet::new();
        members.add(local.node);
        let (events_tx, _) = broadcast::channel(256);
        Ok(Self {
            local,
            local_addr,
            connections: DashMap::new(),
            registry: RwLock::new(registry),
            cluster: Mutex::new(ClusterView {
                view: MembershipView::new(members),
                version: 1,
                election: LeaderElection::new(),
                local_record: None,
            }),
            listeners: RwLock::new(Vec::new()),
            events_tx,
            outbox: Mutex::new(VecDeque::new()),
            dispatch: Mutex::new(()),
            terminated: AtomicBool::new(false),
            foreign_dropped: AtomicU64::new(0),
            stale_dropped: AtomicU64::new(0),
            config,
        })
    }

    /// Local identity.
    #[must_use]
    pub const fn local(&self) -> Identity {
        self.local
    }

    /// Address advertised to peers.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Configuration the manager was built with.
    #[must_use]
    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Registers an application listener.
    pub fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners.write().push(listener);
    }

    /// Subscribe to membership notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events_tx.subscribe()
    }

    /// Current aggregate view.
    #[must_use]
    pub fn view(&self) -> MembershipView {
        self.cluster.lock().view.clone()
    }

    /// Leader of the current stable view, if one has been elected.
    #[must_use]
    pub fn leader(&self) -> Option<Identity> {
        let cluster = self.cluster.lock();
        if cluster.view.is_stable() {
            cluster.election.leader()
        } else {
            None
        }
    }

    /// Returns `true` once [`terminate`](Self::terminate) has been called.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Produces the local heartbeat for this tick. Heartbeat times strictly increase even if
    /// the wall clock stalls.
    pub fn heartbeat(&self, now: Millis) -> HeartbeatRecord {
        let ballot = Ballot {
            preferred: self.config.preferred_leader,
            vote: self.local_vote(&self.connection_views()),
        };
        let mut cluster = self.cluster.lock();
        let heartbeat_time = cluster
            .local_record
            .as_ref()
            .map_or(now, |last| now.max(last.heartbeat_time + 1));
        let record = HeartbeatRecord {
            sender: self.local,
            view: cluster.view.clone(),
            heartbeat_time,
            view_version: cluster.version,
            ballot,
        };
        cluster.local_record = Some(record.clone());
        record
    }

    /// Latest local heartbeat, producing one if none exists yet.
    pub fn local_record(&self, now: Millis) -> HeartbeatRecord {
        let existing = self.cluster.lock().local_record.clone();
        existing.unwrap_or_else(|| self.heartbeat(now))
    }

    /// The most recent heartbeat per connected peer, freshest first, with each peer's address.
    #[must_use]
    pub fn peer_records(&self, limit: usize) -> Vec<(HeartbeatRecord, SocketAddr)> {
        let mut records: Vec<_> = self
            .connection_handles()
            .iter()
            .filter_map(|connection| {
                let connection = connection.lock();
                if connection.protocol.is_terminated() {
                    return None;
                }
                connection
                    .latest
                    .clone()
                    .map(|record| (record, connection.addr))
            })
            .collect();
        records.sort_unstable_by_key(|(record, _)| std::cmp::Reverse(record.heartbeat_time));
        records.truncate(limit);
        records
    }

    /// Feeds a heartbeat received from the network.
    ///
    /// Foreign-cluster, self-originated, quarantined and stale heartbeats are dropped and
    /// reported as [`HeartbeatOutcome::Rejected`]. An error is returned only when the manager
    /// is terminated or a new connection would exceed `max_connections`.
    pub fn receive_heartbeat(
        &self,
        record: &HeartbeatRecord,
        addr: SocketAddr,
        now: Millis,
    ) -> Result<HeartbeatOutcome, ClusterError> {
        if self.is_terminated() {
            return Err(ClusterError::Shutdown);
        }
        let sender = record.sender;
        if !sender.in_cluster(self.config.magic) {
            self.foreign_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %sender, magic = sender.magic, "dropping foreign-cluster heartbeat");
            return Ok(HeartbeatOutcome::Rejected);
        }
        if sender.node == self.local.node || sender.node > MAX_ID {
            return Ok(HeartbeatOutcome::Rejected);
        }

        let existing = self
            .connections
            .get(&sender.node)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(connection) = &existing {
            let current = connection.lock().identity;
            if sender.epoch < current.epoch {
                self.stale_dropped.fetch_add(1, Ordering::Relaxed);
                trace!(peer = %sender, current = %current, "dropping heartbeat from old epoch");
                return Ok(HeartbeatOutcome::Rejected);
            }
        } else if self.connections.len() >= self.config.max_connections {
            warn!(peer = %sender, limit = self.config.max_connections, "connection table full");
            return Err(ClusterError::ConnectionLimit {
                limit: self.config.max_connections,
            });
        }

        let admission = self
            .registry
            .write()
            .admit(sender, addr, record.heartbeat_time, now);
        match admission {
            Admission::Quarantined => {
                trace!(peer = %sender, "ignoring quarantined peer");
                return Ok(HeartbeatOutcome::Rejected);
            }
            Admission::Stale => {
                self.stale_dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(HeartbeatOutcome::Rejected);
            }
            Admission::Live { new } => {
                if new {
                    info!(peer = %sender, %addr, "peer became live");
                }
            }
        }

        let (connection, created) = self.connection_for(sender, addr)?;
        let outcome = {
            let mut connection = connection.lock();
            if self.is_terminated() {
                connection.protocol.terminate();
                return Err(ClusterError::Shutdown);
            }
            let outcome = connection.protocol.receive_heartbeat(record);
            if outcome.is_accepted() {
                connection.detector.heartbeat(now);
                connection.candidate.record_ballot(record.ballot);
                connection.latest = Some(record.clone());
                connection.addr = addr;
                connection.suspected = false;
            }
            outcome
        };

        if !outcome.is_accepted() {
            self.stale_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(outcome);
        }
        if created || outcome == HeartbeatOutcome::ViewChanged {
            self.refresh_membership();
        }
        self.evaluate(now);
        Ok(outcome)
    }

    /// Identities whose failure detector convicts them at `now`.
    #[must_use]
    pub fn convicted(&self, now: Millis) -> Vec<Identity> {
        self.connection_handles()
            .iter()
            .filter_map(|connection| {
                let connection = connection.lock();
                (!connection.protocol.is_terminated() && connection.detector.should_convict(now))
                    .then_some(connection.identity)
            })
            .collect()
    }

    /// Marks `identity` unreachable, terminates and removes its connection and evicts it from
    /// the aggregate view. Returns the address whose transport resources should be released.
    pub fn evict(&self, identity: Identity, now: Millis) -> Option<SocketAddr> {
        let (_, connection) = self
            .connections
            .remove_if(&identity.node, |_, connection| {
                connection.lock().identity == identity
            })?;
        let (last_heartbeat, addr) = {
            let mut connection = connection.lock();
            connection.protocol.terminate();
            (connection.protocol.last_heartbeat(), connection.addr)
        };
        self.registry
            .write()
            .mark_unreachable(identity, last_heartbeat, now);
        info!(peer = %identity, "evicted peer from membership");
        self.refresh_membership();
        self.evaluate(now);
        Some(addr)
    }

    /// Periodic connection sweep.
    ///
    /// Quiesced connections are removed and connections that are merely not timely are
    /// flagged suspect to their failure detector. Ends by re-evaluating the aggregate view, so
    /// a node without peers still stabilizes on its own.
    pub fn sweep(&self, now: Millis) -> SweepReport {
        if self.is_terminated() {
            return SweepReport::default();
        }
        let timeout = self.config.heartbeat.timeout;
        let quiesce = self.config.heartbeat.quiesce_timeout;
        let mut report = SweepReport::default();
        let mut quiesced = Vec::new();

        for connection in self.connection_handles() {
            let mut connection = connection.lock();
            if connection.protocol.is_terminated() {
                continue;
            }
            if connection.protocol.is_quiesced(now, quiesce) {
                quiesced.push(connection.identity);
            } else if connection.protocol.is_not_timely(now, timeout) {
                connection.detector.suspect();
                if !connection.suspected {
                    debug!(peer = %connection.identity, "connection not timely; flagged suspect");
                }
                connection.suspected = true;
                report.suspected.push(connection.identity);
            }
        }

        for identity in quiesced {
            if let Some(addr) = self.evict(identity, now) {
                report.removed.push((identity, addr));
            }
        }
        report.forgotten = self.registry.write().forget_expired(now);
        self.evaluate(now);
        report
    }

    /// Terminates every protocol and drops all connections. Idempotent; returns the addresses
    /// whose transport resources should be released.
    ///
    /// The aggregate view is frozen from this point: heartbeats already in flight are refused
    /// with [`ClusterError::Shutdown`] and nothing further is published.
    pub fn terminate(&self) -> Vec<SocketAddr> {
        {
            let _cluster = self.cluster.lock();
            if self.terminated.swap(true, Ordering::AcqRel) {
                return Vec::new();
            }
            self.outbox.lock().clear();
        }
        let handles = self.connection_handles();
        self.connections.clear();
        let released: Vec<_> = handles
            .iter()
            .map(|connection| {
                let mut connection = connection.lock();
                connection.protocol.terminate();
                connection.addr
            })
            .collect();
        info!(node = %self.local, connections = released.len(), "connection manager terminated");
        released
    }

    /// Picks gossip targets through the registry.
    pub fn select_targets<R: rand::Rng>(&self, fanout: usize, rng: &mut R) -> Vec<SocketAddr> {
        self.registry.read().select_targets(fanout, rng)
    }

    /// Aggregate state counts for diagnostics.
    #[must_use]
    pub fn stats(&self) -> MembershipStats {
        let registry = self.registry.read();
        MembershipStats {
            live: registry.live_count(),
            unreachable: registry.unreachable_count(),
            seeds: registry.seeds().len(),
            connections: self.connections.len(),
            foreign_dropped: self.foreign_dropped.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
        }
    }

    /// Per-connection snapshots for monitoring.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<_> = self
            .connection_handles()
            .iter()
            .map(|connection| connection.lock().snapshot())
            .collect();
        peers.sort_unstable_by_key(|peer| peer.identity);
        peers
    }

    /// Registry entries for monitoring.
    #[must_use]
    pub fn registry_entries(&self) -> Vec<RegistryEntry> {
        self.registry.read().entries()
    }

    fn connection_handles(&self) -> Vec<Arc<Mutex<PeerConnection>>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn connection_views(&self) -> Vec<ConnectionView> {
        self.connection_handles()
            .iter()
            .filter_map(|connection| {
                let connection = connection.lock();
                (!connection.protocol.is_terminated()).then(|| ConnectionView {
                    identity: connection.identity,
                    view: connection.protocol.view().clone(),
                    candidate: connection.candidate,
                })
            })
            .collect()
    }

    /// Returns the connection for `sender`, replacing one held for an older epoch. Nothing is
    /// inserted once the manager is terminated.
    fn connection_for(
        &self,
        sender: Identity,
        addr: SocketAddr,
    ) -> Result<(Arc<Mutex<PeerConnection>>, bool), ClusterError> {
        let mut created = false;
        let mut replaced = None;
        let connection = {
            let entry = self.connections.entry(sender.node);
            if self.is_terminated() {
                return Err(ClusterError::Shutdown);
            }
            let mut entry = entry.or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(PeerConnection::new(sender, addr, &self.config)))
            });
            let current = entry.value().lock().identity;
            if sender.is_restart_of(&current) {
                info!(peer = %sender, previous = %current, "peer restarted; replacing connection");
                replaced = Some(std::mem::replace(
                    entry.value_mut(),
                    Arc::new(Mutex::new(PeerConnection::new(sender, addr, &self.config))),
                ));
                created = true;
            }
            Arc::clone(entry.value())
        };
        if let Some(previous) = replaced {
            previous.lock().protocol.terminate();
        }
        Ok((connection, created))
    }

    fn local_vote(&self, connections: &[ConnectionView]) -> Identity {
        let preferred = connections
            .iter()
            .filter(|connection| connection.candidate.preferred())
            .map(|connection| connection.identity)
            .chain(self.config.preferred_leader.then_some(self.local));
        choose_vote(self.local, preferred)
    }

    /// Recomputes the aggregate member set from the open connections. A change bumps the
    /// view version, destabilizes the view and starts a new election round.
    fn refresh_membership(&self) {
        let mut members = MemberIdSet::new();
        members.add(self.local.node);
        for entry in &self.connections {
            members.add(*entry.key());
        }

        let changed = {
            let mut cluster = self.cluster.lock();
            if self.is_terminated() {
                return;
            }
            if cluster.view.replace_members(members) {
                cluster.version += 1;
                let round = cluster.election.begin_round();
                info!(
                    members = %cluster.view.members(),
                    version = cluster.version,
                    round,
                    "membership changed"
                );
                true
            } else {
                false
            }
        };
        if changed {
            for connection in self.connection_handles() {
                connection.lock().candidate.clear_vote();
            }
        }
    }

    /// Checks whether every connection agrees with the aggregate view; if so, elects a leader
    /// and publishes the stable view, or aligns the stable view's timestamp.
    fn evaluate(&self, now: Millis) {
        let connections = self.connection_views();
        let local_vote = self.local_vote(&connections);

        {
            let mut cluster = self.cluster.lock();
            if self.is_terminated() {
                return;
            }
            let members = cluster.view.members().clone();
            if !connections
                .iter()
                .all(|connection| connection.view.members() == &members)
            {
                return;
            }
            let latest_remote = connections
                .iter()
                .filter(|connection| connection.view.is_stable())
                .map(|connection| connection.view.timestamp())
                .max()
                .unwrap_or(0);

            let event = if cluster.view.is_stable() {
                cluster
                    .view
                    .advance_to(latest_remote)
                    .then(|| ClusterEvent::ViewTimeChanged {
                        view: cluster.view.clone(),
                    })
            } else {
                let participants: Vec<_> = std::iter::once(Participant {
                    identity: self.local,
                    preferred: self.config.preferred_leader,
                    vote: Some(local_vote),
                })
                .chain(connections.iter().map(|connection| Participant {
                    identity: connection.identity,
                    preferred: connection.candidate.preferred(),
                    vote: connection.candidate.vote(),
                }))
                .collect();
                let leader = cluster.election.elect(&members, &participants);
                leader.map(|leader| {
                    cluster.view.stabilize(now.max(latest_remote));
                    ClusterEvent::ViewChanged {
                        view: cluster.view.clone(),
                        leader,
                    }
                })
            };
            match event {
                Some(event) => self.outbox.lock().push_back(event),
                None => return,
            }
        }
        self.flush();
    }

    /// Delivers queued events in order. Whoever holds `dispatch` drains the queue; other
    /// callers leave their events to it.
    fn flush(&self) {
        loop {
            let Some(dispatching) = self.dispatch.try_lock() else {
                return;
            };
            loop {
                if self.is_terminated() {
                    self.outbox.lock().clear();
                    return;
                }
                let next = self.outbox.lock().pop_front();
                match next {
                    Some(event) => self.deliver(event),
                    None => break,
                }
            }
            drop(dispatching);
            if self.outbox.lock().is_empty() {
                return;
            }
        }
    }

    fn deliver(&self, event: ClusterEvent) {
        let listeners = self.listeners.read().clone();
        match &event {
            ClusterEvent::ViewChanged { view, leader } => {
                info!(members = %view.members(), leader = %leader, timestamp = view.timestamp(), "stable view");
                for listener in &listeners {
                    listener.on_view_change(view, *leader);
                }
            }
            ClusterEvent::ViewTimeChanged { view } => {
                debug!(timestamp = view.timestamp(), "stable view time changed");
                for listener in &listeners {
                    listener.on_view_time_change(view);
                }
            }
        }
        let _ = self.events_tx.send(event);
    }
}
