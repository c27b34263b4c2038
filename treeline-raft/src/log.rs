//! The entry-level view of the replicated log.

use crate::error::RaftError;
use crate::raft_types::LogId;

/// The log positions a replica tracks about its own replicated log.
///
/// This is the in-memory view over the durable journal: the id of the last appended entry, the
/// committed and applied boundaries below it, and the id of the last entry covered by the
/// current snapshot. The invariants between these fields are what the rest of the protocol
/// leans on:
///
/// - `last_applied <= committed <= last_log_id.index`
/// - no entry at or below `snapshot_last_log_id.index` is required to still be in the journal
/// - truncation never reaches at or below `committed`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogState {
    /// The id of the last entry appended to the log.
    pub last_log_id: LogId,
    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// The definition of a committed log is that the leader which has created the log has
    /// successfully replicated the log to a majority of the cluster. This value is updated via
    /// AppendEntries RPC from the leader, or if a node is the leader, it will update this value
    /// as new entries have been successfully replicated to a majority of the cluster.
    pub committed: u64,
    /// The index of the highest log entry which has been applied to the local state machine.
    pub last_applied: u64,
    /// The id of the last entry covered by the current snapshot, if a snapshot exists.
    pub snapshot_last_log_id: LogId,
}

impl LogState {
    /// Check whether a candidate's log is at least as up-to-date as this one (§5.4.1).
    ///
    /// Compared by last term first, then by last index.
    pub fn is_up_to_date(&self, candidate_last_log_id: &LogId) -> bool {
        *candidate_last_log_id >= self.last_log_id
    }

    /// Guard a truncation which would remove `from_index` and everything after it.
    ///
    /// Truncating a committed entry is not a recoverable condition; the caller must treat the
    /// returned error as fatal for the replica.
    pub fn assert_truncatable(&self, from_index: u64) -> Result<(), RaftError> {
        if from_index <= self.committed {
            return Err(RaftError::CommittedLogTruncation {
                index: from_index,
                committed: self.committed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_to_date_is_term_then_index() {
        let local = LogState {
            last_log_id: LogId::new(2, 10),
            ..Default::default()
        };
        assert!(local.is_up_to_date(&LogId::new(3, 1)));
        assert!(local.is_up_to_date(&LogId::new(2, 10)));
        assert!(local.is_up_to_date(&LogId::new(2, 11)));
        assert!(!local.is_up_to_date(&LogId::new(2, 9)));
        assert!(!local.is_up_to_date(&LogId::new(1, 100)));
    }

    #[test]
    fn truncation_below_committed_is_rejected() {
        let local = LogState {
            last_log_id: LogId::new(1, 10),
            committed: 5,
            ..Default::default()
        };
        assert!(local.assert_truncatable(6).is_ok());
        let err = local.assert_truncatable(5).unwrap_err();
        assert!(matches!(err, RaftError::CommittedLogTruncation { index: 5, committed: 5 }));
        assert!(local.assert_truncatable(1).is_err());
    }
}
