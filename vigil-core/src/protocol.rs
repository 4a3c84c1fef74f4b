use std::time::Duration;

use tracing::trace;

use crate::clock::{Millis, duration_millis};
use crate::identity::Identity;
use crate::view::{HeartbeatRecord, MembershipView};

/// Lifecycle of a [`ViewProtocol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Accepting heartbeats.
    Active,
    /// Terminal; every further heartbeat is rejected.
    Terminated,
}

/// Result of feeding a heartbeat into a [`ViewProtocol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Terminated protocol, or a heartbeat no newer than the last accepted one.
    Rejected,
    /// Newer heartbeat with nothing else to report.
    Accepted,
    /// Only the remote view's logical timestamp moved.
    ViewTimeChanged,
    /// The remote membership bitmap or view version changed.
    ViewChanged,
}

impl HeartbeatOutcome {
    /// Returns `true` unless the heartbeat was rejected.
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Per-connection state machine tracking one remote peer's heartbeats and view.
///
/// The transport is unordered, so a heartbeat is accepted only when its time is strictly
/// newer than the last one accepted. Duplicates and reordered deliveries leave the state
/// untouched.
#[derive(Debug, Clone)]
pub struct ViewProtocol {
    remote: Identity,
    state: ProtocolState,
    view: MembershipView,
    view_version: u64,
    last_heartbeat: Option<Millis>,
}

impl ViewProtocol {
    /// Creates an active protocol for `remote` that has not seen any heartbeat yet.
    #[must_use]
    pub fn new(remote: Identity) -> Self {
        Self {
            remote,
            state: ProtocolState::Active,
            view: MembershipView::default(),
            view_version: 0,
            last_heartbeat: None,
        }
    }

    /// Remote identity this protocol tracks.
    #[must_use]
    pub const fn remote(&self) -> Identity {
        self.remote
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ProtocolState {
        self.state
    }

    /// Latest view reported by the remote.
    #[must_use]
    pub const fn view(&self) -> &MembershipView {
        &self.view
    }

    /// Latest view version reported by the remote.
    #[must_use]
    pub const fn view_version(&self) -> u64 {
        self.view_version
    }

    /// Remote time of the last accepted heartbeat.
    #[must_use]
    pub const fn last_heartbeat(&self) -> Option<Millis> {
        self.last_heartbeat
    }

    /// Ingests a heartbeat. View changes take priority over time-only changes.
    pub fn receive_heartbeat(&mut self, record: &HeartbeatRecord) -> HeartbeatOutcome {
        if self.state == ProtocolState::Terminated {
            return HeartbeatOutcome::Rejected;
        }
        if self
            .last_heartbeat
            .is_some_and(|last| record.heartbeat_time <= last)
        {
            trace!(
                peer = %self.remote,
                time = record.heartbeat_time,
                "dropping stale heartbeat"
            );
            return HeartbeatOutcome::Rejected;
        }

        let first = self.last_heartbeat.is_none();
        self.last_heartbeat = Some(record.heartbeat_time);

        if first
            || record.view_version != self.view_version
            || record.view.members() != self.view.members()
        {
            self.view = record.view.clone();
            self.view_version = record.view_version;
            return HeartbeatOutcome::ViewChanged;
        }
        if record.view.timestamp() != self.view.timestamp()
            || record.view.is_stable() != self.view.is_stable()
        {
            self.view = record.view.clone();
            return HeartbeatOutcome::ViewTimeChanged;
        }
        HeartbeatOutcome::Accepted
    }

    /// `true` when the last heartbeat is further than `bound` from `now` in either direction.
    ///
    /// The difference is absolute so that skew on either clock trips the check.
    #[must_use]
    pub fn is_not_timely(&self, now: Millis, bound: Duration) -> bool {
        self.last_heartbeat
            .is_some_and(|last| now.abs_diff(last) > duration_millis(bound).unsigned_abs())
    }

    /// `true` when nothing has been heard for longer than `quiesce_bound`.
    #[must_use]
    pub fn is_quiesced(&self, now: Millis, quiesce_bound: Duration) -> bool {
        self.last_heartbeat
            .is_some_and(|last| now - last > duration_millis(quiesce_bound))
    }

    /// `true` once the protocol has been terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state == ProtocolState::Terminated
    }

    /// Moves to the terminal state. Safe to call repeatedly.
    pub fn terminate(&mut self) {
        self.state = ProtocolState::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member_set::MemberIdSet;
    use crate::view::Ballot;

    fn remote() -> Identity {
        Identity::new(1, 2, 100)
    }

    fn record(time: Millis, members: &[u32], version: u64, stamp: Option<Millis>) -> HeartbeatRecord {
        let mut view = MembershipView::new(members.iter().copied().collect::<MemberIdSet>());
        if let Some(stamp) = stamp {
            view.stabilize(stamp);
        }
        HeartbeatRecord {
            sender: remote(),
            view,
            heartbeat_time: time,
            view_version: version,
            ballot: Ballot {
                preferred: false,
                vote: remote(),
            },
        }
    }

    #[test]
    fn stale_heartbeats_are_rejected_without_mutation() {
        let mut protocol = ViewProtocol::new(remote());
        assert_eq!(
            protocol.receive_heartbeat(&record(1_000, &[1, 2], 1, None)),
            HeartbeatOutcome::ViewChanged
        );
        let before = protocol.clone();

        for time in [1_000, 1_000, 999, 500, 1_000] {
            assert_eq!(
                protocol.receive_heartbeat(&record(time, &[1, 2, 3], 2, Some(5))),
                HeartbeatOutcome::Rejected
            );
            assert_eq!(protocol.last_heartbeat(), before.last_heartbeat());
            assert_eq!(protocol.view(), before.view());
            assert_eq!(protocol.view_version(), before.view_version());
        }
    }

    #[test]
    fn distinguishes_view_and_time_changes() {
        let mut protocol = ViewProtocol::new(remote());
        protocol.receive_heartbeat(&record(1, &[1, 2], 1, Some(10)));
        assert_eq!(
            protocol.receive_heartbeat(&record(2, &[1, 2], 1, Some(10))),
            HeartbeatOutcome::Accepted
        );
        assert_eq!(
            protocol.receive_heartbeat(&record(3, &[1, 2], 1, Some(20))),
            HeartbeatOutcome::ViewTimeChanged
        );
        assert_eq!(
            protocol.receive_heartbeat(&record(4, &[1, 2], 2, Some(30))),
            HeartbeatOutcome::ViewChanged
        );
        assert_eq!(
            protocol.receive_heartbeat(&record(5, &[1], 2, Some(30))),
            HeartbeatOutcome::ViewChanged
        );
        assert_eq!(protocol.view().timestamp(), 30);
    }

    #[test]
    fn timeliness_is_symmetric() {
        let mut protocol = ViewProtocol::new(remote());
        let bound = Duration::from_millis(1_000);
        assert!(!protocol.is_not_timely(50_000, bound));
        protocol.receive_heartbeat(&record(10_000, &[1], 1, None));

        assert!(!protocol.is_not_timely(10_900, bound));
        assert!(!protocol.is_not_timely(9_100, bound));
        assert!(protocol.is_not_timely(11_001, bound));
        assert!(protocol.is_not_timely(8_999, bound));
    }

    #[test]
    fn quiescence_is_one_sided() {
        let mut protocol = ViewProtocol::new(remote());
        protocol.receive_heartbeat(&record(10_000, &[1], 1, None));
        let bound = Duration::from_secs(3);
        assert!(!protocol.is_quiesced(5_000, bound));
        assert!(!protocol.is_quiesced(13_000, bound));
        assert!(protocol.is_quiesced(13_001, bound));
    }

    #[test]
    fn terminate_is_idempotent_and_final() {
        let mut protocol = ViewProtocol::new(remote());
        protocol.terminate();
        protocol.terminate();
        assert!(protocol.is_terminated());
        assert_eq!(
            protocol.receive_heartbeat(&record(1, &[1], 1, None)),
            HeartbeatOutcome::Rejected
        );
        assert_eq!(protocol.last_heartbeat(), None);
    }
}
