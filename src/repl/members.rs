use super::OpTime;

use serde_json::Value;
use std::collections::HashMap;

/// A named write concern rule from the replica set config. The membership
/// service maintains `last` as the newest position acknowledged by a set of
/// members satisfying the rule's tags; the tracker only ever reads it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TagRule {
    /// The newest position replicated per this rule.
    pub last: OpTime,
}

/// The replica set membership service, as seen by the tracker.
pub trait Membership: Send + Sync {
    /// Returns true if this node is a member of a replica set. Legacy
    /// single-primary deployments track slaves too, but have no set config,
    /// no tag rules, and nothing to percolate to.
    fn in_replica_set(&self) -> bool;

    /// Returns true if this node currently believes itself to be primary.
    fn is_primary(&self) -> bool;

    /// The number of members forming a majority of the set. Counts the
    /// entire set, arbiters included, since a majority of the set can
    /// otherwise fall short of a majority of voters.
    fn majority_count(&self) -> u64;

    /// The named write concern rules of the current set config.
    fn tag_rules(&self) -> HashMap<String, TagRule>;

    /// This node's own member config document.
    fn my_config(&self) -> Value;
}
