use super::OpTime;

use serde_json::Value;
use uuid::Uuid;

/// The chained-replication sync service. Slaves may sync from other slaves
/// rather than directly from the primary, so progress reports must travel
/// up the chain; this service owns the rid-to-slave bookkeeping that makes
/// that possible. Both calls are fire-and-forget enqueues.
pub trait GhostSync: Send + Sync {
    /// Records a slave's progress on the primary, so chained slaves can be
    /// matched back to their remote ids.
    fn update_slave(&self, rid: Uuid, op: OpTime);

    /// Forwards a slave's progress from this non-primary member toward the
    /// primary along the replication chain.
    fn percolate(&self, rid: &Value, op: OpTime);
}
