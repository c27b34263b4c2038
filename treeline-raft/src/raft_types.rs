use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

/// The identity of a raft log entry.
///
/// A term and an index identifies a log entry globally: two entries carrying the same `LogId`
/// on two replicas are the same entry, and by the log matching property everything before them
/// is identical as well. The derived ordering (term first, then index) is the "at least as
/// up-to-date" comparison used when granting votes.
#[derive(Debug, Default, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl From<(u64, u64)> for LogId {
    fn from(v: (u64, u64)) -> Self {
        LogId { term: v.0, index: v.1 }
    }
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// Every time a snapshot is created, it is assigned a globally unique id.
pub type SnapshotId = String;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_id_ordering_compares_term_before_index() {
        assert!(LogId::new(2, 1) > LogId::new(1, 100));
        assert!(LogId::new(2, 5) > LogId::new(2, 4));
        assert_eq!(LogId::new(3, 3), LogId::new(3, 3));
    }
}
