use serde::{Deserialize, Serialize};

use crate::clock::Millis;
use crate::identity::Identity;
use crate::member_set::MemberIdSet;

/// Membership snapshot with a stability flag and logical timestamp.
///
/// Any mutation clears `stable`; only [`MembershipView::stabilize`] sets it again, bumping
/// the timestamp strictly forward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
    members: MemberIdSet,
    stable: bool,
    timestamp: Millis,
}

impl MembershipView {
    /// Creates an unstable view over `members`.
    #[must_use]
    pub const fn new(members: MemberIdSet) -> Self {
        Self {
            members,
            stable: false,
            timestamp: 0,
        }
    }

    /// Current member ids.
    #[must_use]
    pub const fn members(&self) -> &MemberIdSet {
        &self.members
    }

    /// Whether the protocol layer has declared this view stable.
    #[must_use]
    pub const fn is_stable(&self) -> bool {
        self.stable
    }

    /// Logical timestamp of the last stabilization.
    #[must_use]
    pub const fn timestamp(&self) -> Millis {
        self.timestamp
    }

    /// Adds `id`; destabilizes the view if membership changed.
    pub fn add(&mut self, id: u32) -> bool {
        let changed = self.members.add(id);
        if changed {
            self.stable = false;
        }
        changed
    }

    /// Removes `id`; destabilizes the view if membership changed.
    pub fn remove(&mut self, id: u32) -> bool {
        let changed = self.members.remove(id);
        if changed {
            self.stable = false;
        }
        changed
    }

    /// Replaces the member set; destabilizes the view if it differs.
    pub fn replace_members(&mut self, members: MemberIdSet) -> bool {
        if self.members == members {
            return false;
        }
        self.members = members;
        self.stable = false;
        true
    }

    /// Marks the view stable at `now`. The timestamp never moves backwards, even under clock
    /// regression.
    pub fn stabilize(&mut self, now: Millis) {
        self.timestamp = now.max(self.timestamp.saturating_add(1));
        self.stable = true;
    }

    /// Moves the timestamp of a stable view forward to `timestamp`, returning `true` if it
    /// moved. Used to align on the latest stabilization seen across the cluster.
    pub fn advance_to(&mut self, timestamp: Millis) -> bool {
        if !self.stable || timestamp <= self.timestamp {
            return false;
        }
        self.timestamp = timestamp;
        true
    }
}

/// Leader-election ballot carried on every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    /// Whether the sender is configured as a preferred leader.
    pub preferred: bool,
    /// Identity the sender votes for.
    pub vote: Identity,
}

/// Immutable heartbeat payload produced once per local tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    /// Identity of the producing node.
    pub sender: Identity,
    /// The sender's aggregate view at send time.
    pub view: MembershipView,
    /// Sender wall-clock time of the tick.
    pub heartbeat_time: Millis,
    /// Counter bumped by the sender on every membership change.
    pub view_version: u64,
    /// The sender's current election ballot.
    pub ballot: Ballot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_clears_stability() {
        let mut view = MembershipView::new([1, 2].into_iter().collect());
        view.stabilize(100);
        assert!(view.is_stable());
        assert!(!view.add(2));
        assert!(view.is_stable());
        assert!(view.add(3));
        assert!(!view.is_stable());
    }

    #[test]
    fn stabilize_saturates_at_the_latest_time() {
        let mut view = MembershipView::new([1].into_iter().collect());
        view.stabilize(10);
        assert!(view.advance_to(Millis::MAX));
        view.add(2);
        view.stabilize(20);
        assert!(view.is_stable());
        assert_eq!(view.timestamp(), Millis::MAX);
    }

    #[test]
    fn timestamp_strictly_increases() {
        let mut view = MembershipView::default();
        view.stabilize(1_000);
        assert_eq!(view.timestamp(), 1_000);
        view.stabilize(900);
        assert_eq!(view.timestamp(), 1_001);
        assert!(!view.advance_to(1_001));
        assert!(view.advance_to(2_000));
        assert_eq!(view.timestamp(), 2_000);

        view.add(9);
        assert!(!view.advance_to(3_000));
    }
}
