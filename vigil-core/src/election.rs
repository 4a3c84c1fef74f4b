use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::identity::Identity;
use crate::member_set::MemberIdSet;
use crate::view::Ballot;

/// Per-connection election state: whether the remote is a preferred leader and the vote it
/// cast in the current round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Candidate {
    preferred: bool,
    vote: Option<Identity>,
}

impl Candidate {
    /// Records the ballot carried by the remote's latest heartbeat.
    pub fn record_ballot(&mut self, ballot: Ballot) {
        self.preferred = ballot.preferred;
        self.vote = Some(ballot.vote);
    }

    /// Forgets the received vote; called when a new round starts.
    pub fn clear_vote(&mut self) {
        self.vote = None;
    }

    /// Whether the remote is configured as a preferred leader.
    #[must_use]
    pub const fn preferred(&self) -> bool {
        self.preferred
    }

    /// Vote received in the current round, if any.
    #[must_use]
    pub const fn vote(&self) -> Option<Identity> {
        self.vote
    }
}

/// One participant of an election round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    /// Participant identity.
    pub identity: Identity,
    /// Whether the participant is a preferred leader.
    pub preferred: bool,
    /// Vote cast by the participant, if received.
    pub vote: Option<Identity>,
}

/// Vote count accumulated by a single nominee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    /// Nominee identity.
    pub identity: Identity,
    /// Whether the nominee is a preferred leader.
    pub preferred: bool,
    /// Votes received.
    pub votes: usize,
}

impl Tally {
    /// Deterministic comparison: a preferred nominee beats a non-preferred one, then more
    /// votes win, then the lower identity wins.
    #[must_use]
    pub fn wins_against(&self, other: &Self) -> bool {
        self.rank(other) == Ordering::Greater
    }

    fn rank(&self, other: &Self) -> Ordering {
        self.preferred
            .cmp(&other.preferred)
            .then(self.votes.cmp(&other.votes))
            .then(other.identity.cmp(&self.identity))
    }
}

/// Picks the ballot a node casts: the lowest preferred peer it can see, or itself.
#[must_use]
pub fn choose_vote(local: Identity, preferred: impl IntoIterator<Item = Identity>) -> Identity {
    preferred.into_iter().min().unwrap_or(local)
}

/// Single-round plurality election over a stable view.
#[derive(Debug, Default)]
pub struct LeaderElection {
    round: u64,
    leader: Option<Identity>,
}

impl LeaderElection {
    /// Creates an election that has not produced a leader yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            round: 0,
            leader: None,
        }
    }

    /// Starts a new round. Callers clear every [`Candidate`] vote alongside.
    pub fn begin_round(&mut self) -> u64 {
        self.round += 1;
        self.leader = None;
        self.round
    }

    /// Current round number.
    #[must_use]
    pub const fn round(&self) -> u64 {
        self.round
    }

    /// Leader elected in the current round, if any.
    #[must_use]
    pub const fn leader(&self) -> Option<Identity> {
        self.leader
    }

    /// Tallies the votes of `participants` over `members`.
    ///
    /// Returns `None` until every member is represented and has voted. Votes naming a
    /// non-member are discarded.
    pub fn elect(&mut self, members: &MemberIdSet, participants: &[Participant]) -> Option<Identity> {
        let leader = Self::tally(members, participants)?
            .into_values()
            .reduce(|best, next| if next.wins_against(&best) { next } else { best })
            .map(|winner| winner.identity);
        self.leader = leader;
        leader
    }

    /// Builds per-nominee tallies, or `None` when the vote set is incomplete.
    #[must_use]
    pub fn tally(members: &MemberIdSet, participants: &[Participant]) -> Option<BTreeMap<u32, Tally>> {
        let mut tallies: BTreeMap<u32, Tally> = participants
            .iter()
            .filter(|participant| members.contains(participant.identity.node))
            .map(|participant| {
                (
                    participant.identity.node,
                    Tally {
                        identity: participant.identity,
                        preferred: participant.preferred,
                        votes: 0,
                    },
                )
            })
            .collect();
        if tallies.len() != members.cardinality() {
            return None;
        }

        for participant in participants {
            if !members.contains(participant.identity.node) {
                continue;
            }
            let vote = participant.vote?;
            if let Some(tally) = tallies
                .get_mut(&vote.node)
                .filter(|tally| tally.identity == vote)
            {
                tally.votes += 1;
            }
        }
        Some(tallies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use rand::seq::SliceRandom;

    fn id(node: u32) -> Identity {
        Identity::new(1, node, 10)
    }

    fn participant(node: u32, preferred: bool, vote: u32) -> Participant {
        Participant {
            identity: id(node),
            preferred,
            vote: Some(id(vote)),
        }
    }

    #[test]
    fn every_ordering_elects_the_same_leader() {
        let members: MemberIdSet = (1..=5).collect();
        let votes = vec![
            participant(1, false, 3),
            participant(2, false, 3),
            participant(3, false, 3),
            participant(4, false, 5),
            participant(5, false, 5),
        ];
        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..32 {
            let mut shuffled = votes.clone();
            shuffled.shuffle(&mut rng);
            let mut election = LeaderElection::new();
            assert_eq!(election.elect(&members, &shuffled), Some(id(3)));
        }
    }

    #[test]
    fn ties_fall_back_to_lower_identity() {
        let members: MemberIdSet = [4, 7, 9].into_iter().collect();
        let votes = [
            participant(9, false, 9),
            participant(7, false, 7),
            participant(4, false, 4),
        ];
        assert_eq!(LeaderElection::new().elect(&members, &votes), Some(id(4)));
    }

    #[test]
    fn preferred_leader_always_wins() {
        let members: MemberIdSet = [1, 2, 3].into_iter().collect();
        let votes = [
            participant(1, false, 1),
            participant(2, false, 1),
            participant(3, true, 3),
        ];
        assert_eq!(LeaderElection::new().elect(&members, &votes), Some(id(3)));
    }

    #[test]
    fn incomplete_vote_sets_do_not_elect() {
        let members: MemberIdSet = [1, 2].into_iter().collect();
        let mut election = LeaderElection::new();
        assert_eq!(election.elect(&members, &[participant(1, false, 1)]), None);

        let missing_vote = [
            participant(1, false, 1),
            Participant {
                identity: id(2),
                preferred: false,
                vote: None,
            },
        ];
        assert_eq!(election.elect(&members, &missing_vote), None);
    }

    #[test]
    fn votes_for_outsiders_are_discarded() {
        let members: MemberIdSet = [1, 2].into_iter().collect();
        let votes = [participant(1, false, 8), participant(2, false, 2)];
        let tallies = LeaderElection::tally(&members, &votes).unwrap();
        assert_eq!(tallies[&2].votes, 1);
        assert_eq!(tallies[&1].votes, 0);
    }

    #[test]
    fn vote_prefers_lowest_preferred_peer() {
        assert_eq!(choose_vote(id(5), [id(9), id(2)]), id(2));
        assert_eq!(choose_vote(id(5), []), id(5));
    }

    #[test]
    fn candidate_vote_resets() {
        let mut candidate = Candidate::default();
        candidate.record_ballot(Ballot {
            preferred: true,
            vote: id(3),
        });
        assert_eq!(candidate.vote(), Some(id(3)));
        candidate.clear_vote();
        assert_eq!(candidate.vote(), None);
        assert!(candidate.preferred());
    }
}
