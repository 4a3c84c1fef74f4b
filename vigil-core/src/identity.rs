use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a cluster process.
///
/// `magic` fences off traffic from foreign clusters, `node` indexes membership bit sets and
/// `epoch` distinguishes restarts of the same node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Cluster-wide fence value.
    pub magic: u32,
    /// Small integer node identifier, used as a bit index.
    pub node: u32,
    /// Incarnation of the node, typically its start time in milliseconds.
    pub epoch: u64,
}

impl Identity {
    /// Creates a new identity.
    #[must_use]
    pub const fn new(magic: u32, node: u32, epoch: u64) -> Self {
        Self { magic, node, epoch }
    }

    /// Returns `true` when the identity belongs to the cluster fenced by `magic`.
    #[must_use]
    pub const fn in_cluster(&self, magic: u32) -> bool {
        self.magic == magic
    }

    /// Returns `true` if `other` is the same node from a later restart.
    #[must_use]
    pub const fn is_restart_of(&self, other: &Self) -> bool {
        self.node == other.node && self.epoch > other.epoch
    }
}

impl Ord for Identity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.node
            .cmp(&other.node)
            .then(self.epoch.cmp(&other.epoch))
            .then(self.magic.cmp(&other.magic))
    }
}

impl PartialOrd for Identity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node, self.epoch)
    }
}
