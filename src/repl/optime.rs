use serde::{Deserialize, Serialize};

/// A position in the primary's operation log: a wall-clock second paired
/// with an ordinal distinguishing operations within that second. Totally
/// ordered, with later positions comparing greater.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct OpTime {
    /// Seconds since the Unix epoch.
    pub secs: u32,
    /// The ordinal of the operation within the second.
    pub seq: u32,
}

impl OpTime {
    /// The null position, a sentinel that is never recorded for a slave.
    pub const NULL: OpTime = OpTime { secs: 0, seq: 0 };

    /// Creates a new log position.
    pub fn new(secs: u32, seq: u32) -> Self {
        Self { secs, seq }
    }

    /// Returns true if this is the null sentinel.
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Packs the position into a single 64-bit timestamp, the form stored
    /// in persisted syncedTo fields.
    pub fn as_u64(&self) -> u64 {
        (self.secs as u64) << 32 | self.seq as u64
    }
}

impl std::fmt::Display for OpTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.secs, self.seq)
    }
}
