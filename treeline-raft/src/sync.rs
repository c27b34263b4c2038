//! Follower sync-status tracking.
//!
//! A follower derives a boolean "caught up with the leader" signal from the commit index
//! deltas it observes in AppendEntries traffic. Higher layers use the signal for read routing
//! and availability decisions; it has no effect on the consensus protocol itself.

use crate::NodeId;

/// Tracks whether this follower is in sync with its current leader.
///
/// A follower is in sync once its commit index is within `threshold` of the leader's commit
/// index *and* it has reached the commit index the leader advertised when it first became this
/// follower's leader. The second condition keeps a freshly re-led follower from reporting
/// in-sync off a single heartbeat whose lag happens to be small while it is still replaying a
/// backlog.
#[derive(Debug)]
pub struct SyncStatusTracker {
    /// The maximum commit-index lag within which the follower still counts as in sync.
    threshold: u64,
    /// The leader the current status was computed against.
    synced_leader: Option<NodeId>,
    /// The minimum commit index this follower must reach before it may report in-sync.
    minimum_expected_index: u64,
    in_sync: bool,
}

impl SyncStatusTracker {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            synced_leader: None,
            minimum_expected_index: 0,
            in_sync: false,
        }
    }

    /// The current sync status.
    pub fn in_sync(&self) -> bool {
        self.in_sync
    }

    /// The leader the current status is tracked against.
    pub fn synced_leader(&self) -> Option<NodeId> {
        self.synced_leader
    }

    /// Fold in a leader/commit observation from an AppendEntries request.
    ///
    /// Returns `Some(status)` when the status must be reported: either it flipped, or the
    /// leader changed (a leader change always force-reports not-in-sync, even if the status
    /// was already false). Returns `None` when nothing reportable happened.
    pub fn update(&mut self, leader: NodeId, leader_commit: u64, local_commit: u64) -> Option<bool> {
        if self.synced_leader != Some(leader) {
            // A new leader always starts the follower as unsynced until it proves caught up.
            self.synced_leader = Some(leader);
            self.minimum_expected_index = leader_commit;
            self.in_sync = false;
            return Some(false);
        }

        let lag = leader_commit.saturating_sub(local_commit);
        if lag > self.threshold {
            return self.transition(false);
        }
        if local_commit >= self.minimum_expected_index {
            return self.transition(true);
        }
        // Lag is within threshold but the follower has not yet caught up to where the leader
        // was when it took over; stay unsynced without reporting.
        None
    }

    fn transition(&mut self, status: bool) -> Option<bool> {
        if self.in_sync == status {
            return None;
        }
        self.in_sync = status;
        Some(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follower_within_threshold_is_in_sync() {
        let mut tracker = SyncStatusTracker::new(5);
        assert_eq!(tracker.update(1, 50, 10), Some(false)); // first leader observation
        assert_eq!(tracker.update(1, 100, 96), Some(true));
        assert!(tracker.in_sync());
    }

    #[test]
    fn follower_beyond_threshold_is_not_in_sync() {
        let mut tracker = SyncStatusTracker::new(5);
        tracker.update(1, 50, 10);
        tracker.update(1, 100, 96);
        assert_eq!(tracker.update(1, 100, 90), Some(false));
        assert!(!tracker.in_sync());
    }

    #[test]
    fn unchanged_status_is_not_reported() {
        let mut tracker = SyncStatusTracker::new(5);
        tracker.update(1, 50, 10);
        tracker.update(1, 100, 96);
        assert_eq!(tracker.update(1, 100, 97), None);
        assert_eq!(tracker.update(1, 100, 100), None);
    }

    #[test]
    fn leader_change_always_resets_and_reports() {
        let mut tracker = SyncStatusTracker::new(5);
        tracker.update(1, 50, 10);
        tracker.update(1, 100, 96);
        assert!(tracker.in_sync());

        // New leader, tiny lag: still force-reported as not in sync.
        assert_eq!(tracker.update(2, 100, 99), Some(false));
        assert!(!tracker.in_sync());
        assert_eq!(tracker.synced_leader(), Some(2));

        // Catches back up against the new leader's baseline.
        assert_eq!(tracker.update(2, 101, 100), Some(true));
    }

    #[test]
    fn minimum_expected_index_gates_in_sync() {
        let mut tracker = SyncStatusTracker::new(5);
        // Leader takes over at commit 100; follower is at 10.
        assert_eq!(tracker.update(1, 100, 10), Some(false));
        // Lag shrinks within threshold, but the follower has not reached index 100 yet.
        assert_eq!(tracker.update(1, 100, 97), None);
        assert!(!tracker.in_sync());
        assert_eq!(tracker.update(1, 100, 100), Some(true));
    }
}
