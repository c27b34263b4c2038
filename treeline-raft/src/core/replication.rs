use tokio::sync::oneshot;
use tracing::Instrument;

use crate::core::compaction::SnapshotState;
use crate::core::{LeaderState, ReplicationState, State, UpdateCurrentLeader};
use crate::error::RaftResult;
use crate::raft_types::LogId;
use crate::replication::{RaftEvent, ReplicaEvent, ReplicationStream};
use crate::storage::Snapshot;
use crate::{AppData, AppDataResponse, NodeId, RaftNetwork, RaftStorage, SnapshotPolicy};

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Spawn a new replication stream returning its replication state handle.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState<D> {
        let replstream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.log.last_log_id,
            self.core.log.committed,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: LogId::default(),
            replstream,
        }
    }

    /// Handle a replication event coming from one of the replication streams.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent<S::SnapshotData>) {
        let res = match event {
            ReplicaEvent::UpdateMatched { target, matched } => self.handle_update_matched(target, matched).await,
            ReplicaEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
            ReplicaEvent::NeedsSnapshot { target, tx } => self.handle_needs_snapshot(target, tx).await,
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
                return;
            }
        };
        if let Err(err) = res {
            tracing::error!(error=%err, "error while processing event from replication stream");
        }
    }

    /// Handle events from replication streams for when this node needs to revert to follower
    /// state.
    #[tracing::instrument(level = "trace", skip(self, term))]
    async fn handle_revert_to_follower(&mut self, _: NodeId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
        }
        Ok(())
    }

    /// Handle events from a replication stream which updates the target node's match index.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_update_matched(&mut self, target: NodeId, matched: LogId) -> RaftResult<()> {
        match self.nodes.get_mut(&target) {
            Some(state) => {
                // Stale replies for lower indices than already matched are ignored.
                if matched.index < state.matched.index {
                    return Ok(());
                }
                state.matched = matched;
            }
            None => return Ok(()), // Node not found.
        }
        self.update_leader_metrics();

        // Determine the new commit index over the matched indices of all voting members,
        // including this leader's own last log index.
        let mut indices: Vec<_> = self.nodes.values().map(|node| node.matched.index).collect();
        indices.push(self.core.log.last_log_id.index);
        let new_commit_index = calculate_new_commit_index(indices, self.core.log.committed, self.first_index_of_term);

        if new_commit_index > self.core.log.committed {
            self.core.log.committed = new_commit_index;

            // Update all replication streams based on the new commit index.
            for node in self.nodes.values() {
                let _ = node
                    .replstream
                    .repl_tx
                    .send(RaftEvent::UpdateCommitIndex {
                        commit_index: new_commit_index,
                    })
                    .await;
            }

            // Check if there are any pending requests which need to be processed.
            let filter = self
                .awaiting_committed
                .iter()
                .enumerate()
                .take_while(|(_idx, elem)| elem.entry.log_id.index <= new_commit_index)
                .last()
                .map(|(idx, _)| idx);
            if let Some(offset) = filter {
                for request in self.awaiting_committed.drain(..=offset).collect::<Vec<_>>() {
                    self.client_request_post_commit(request).await;
                }
            }
            self.core.report_metrics();
        }
        Ok(())
    }

    /// Handle events from replication streams requesting for snapshot info.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    async fn handle_needs_snapshot(&mut self, _: NodeId, tx: oneshot::Sender<Snapshot<S::SnapshotData>>) -> RaftResult<()> {
        let threshold = match &self.core.config.snapshot_policy {
            SnapshotPolicy::LogsSinceLast(threshold) => *threshold,
        };

        // Check for existence of current snapshot.
        let current_snapshot_opt = self
            .core
            .storage
            .get_current_snapshot()
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        if let Some(snapshot) = current_snapshot_opt {
            // If snapshot exists, ensure its distance from the leader's last log index is <=
            // half of the configured snapshot threshold, else create a new snapshot.
            if snapshot_is_within_half_of_threshold(&snapshot.meta.last_log_id.index, &self.core.log.last_log_id.index, &threshold) {
                let _ = tx.send(snapshot);
                return Ok(());
            }
        }

        // Check if snapshot creation is already in progress. If so, we spawn a task to await
        // its completion (or cancellation), and respond to the replication stream. The repl
        // stream will wait for the completion and will then send another request to fetch the
        // finished snapshot.
        if let Some(SnapshotState::Snapshotting { handle, sender }) = self.core.snapshot_state.take() {
            let mut chan = sender.subscribe();
            tokio::spawn(
                async move {
                    let _ = chan.recv().await;
                    // Closing the channel signals the stream to re-request the snapshot.
                    drop(tx);
                }
                .instrument(tracing::debug_span!("waiting for in-progress snapshot to complete")),
            );
            self.core.snapshot_state = Some(SnapshotState::Snapshotting { handle, sender });
            return Ok(());
        }

        // A follower needs a snapshot and none is on hand: this is the capture-to-install
        // path, taken regardless of the growth threshold, because the follower's needed log
        // prefix has already been compacted away.
        self.core.trigger_log_compaction_if_needed(true);
        Ok(())
    }
}

/// Determine the value for `current_commit` based on all known indices of the cluster members.
///
/// - `entries`: is a vector of all of the highest known indices to be replicated on a target
///   node, one per node of the cluster, including the leader itself.
/// - `current_commit`: is the Raft node's `current_commit` value before invoking this function.
///   The output of this function will never be less than this value.
/// - `first_index_of_term`: the index of the first entry the leader appended in its own term.
///   A leader may never directly commit an entry from a previous term: the majority-replicated
///   index must reach the leader's own term before the commit index moves at all, and earlier
///   entries then commit transitively (§5.4.2).
fn calculate_new_commit_index(mut entries: Vec<u64>, current_commit: u64, first_index_of_term: u64) -> u64 {
    if entries.is_empty() {
        return current_commit;
    }

    // The offset of the majority position once sorted: everything at or below the value at
    // this offset is replicated on a majority of the cluster.
    entries.sort_unstable();
    let len = entries.len();
    let offset = if (len % 2) == 0 { (len / 2) - 1 } else { len / 2 };
    let new_val = *entries.get(offset).unwrap_or(&current_commit);

    if new_val < first_index_of_term {
        return current_commit;
    }
    std::cmp::max(new_val, current_commit)
}

/// Check if the given snapshot data is within half of the configured threshold.
fn snapshot_is_within_half_of_threshold(snapshot_last_index: &u64, last_log_index: &u64, threshold: &u64) -> bool {
    // Calculate distance from actor's last log index, guarding against underflow.
    let distance_from_line = if snapshot_last_index > last_log_index {
        0u64
    } else {
        last_log_index - snapshot_last_index
    };
    let half_of_threshold = threshold / 2;
    distance_from_line <= half_of_threshold
}

//////////////////////////////////////////////////////////////////////////////////////////////////
//////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    //////////////////////////////////////////////////////////////////////////
    // snapshot_is_within_half_of_threshold //////////////////////////////////

    mod snapshot_is_within_half_of_threshold {
        use super::*;

        macro_rules! test_snapshot_is_within_half_of_threshold {
            ({test=>$name:ident, snapshot_last_index=>$snapshot_last_index:expr, last_log_index=>$last_log:expr, threshold=>$thresh:expr, expected=>$exp:literal}) => {
                #[test]
                fn $name() {
                    let res = snapshot_is_within_half_of_threshold($snapshot_last_index, $last_log, $thresh);
                    assert_eq!(res, $exp)
                }
            };
        }

        test_snapshot_is_within_half_of_threshold!({
            test=>happy_path_true_when_within_half_threshold,
            snapshot_last_index=>&50, last_log_index=>&100, threshold=>&500, expected=>true
        });

        test_snapshot_is_within_half_of_threshold!({
            test=>happy_path_false_when_above_half_threshold,
            snapshot_last_index=>&1, last_log_index=>&500, threshold=>&100, expected=>false
        });

        test_snapshot_is_within_half_of_threshold!({
            test=>guards_against_underflow,
            snapshot_last_index=>&200, last_log_index=>&100, threshold=>&500, expected=>true
        });
    }

    //////////////////////////////////////////////////////////////////////////
    // calculate_new_commit_index ////////////////////////////////////////////

    mod calculate_new_commit_index {
        use super::*;

        macro_rules! test_calculate_new_commit_index {
            ($name:ident, $expected:literal, $current:literal, $term_start:literal, $entries:expr) => {
                #[test]
                fn $name() {
                    let mut entries = $entries;
                    let output = calculate_new_commit_index(entries.clone(), $current, $term_start);
                    entries.sort_unstable();
                    assert_eq!(output, $expected, "Sorted values: {:?}", entries);
                }
            };
        }

        test_calculate_new_commit_index!(basic_values, 10, 5, 0, vec![20, 5, 0, 15, 10]);

        test_calculate_new_commit_index!(len_zero_should_return_current_commit, 20, 20, 0, vec![]);

        test_calculate_new_commit_index!(len_one_where_greater_than_current, 100, 0, 0, vec![100]);

        test_calculate_new_commit_index!(len_one_where_less_than_current, 100, 100, 0, vec![50]);

        test_calculate_new_commit_index!(even_number_of_nodes, 0, 0, 0, vec![0, 100, 0, 100, 0, 100]);

        test_calculate_new_commit_index!(majority_wins, 100, 0, 0, vec![0, 100, 0, 100, 0, 100, 100]);

        // A majority on an index from a previous term must not advance the commit index
        // directly; it only commits transitively once the current term's first entry is
        // majority-replicated.
        test_calculate_new_commit_index!(prior_term_entries_do_not_commit_directly, 5, 5, 11, vec![10, 10, 10]);

        test_calculate_new_commit_index!(commit_advances_at_first_entry_of_term, 11, 5, 11, vec![11, 11, 10]);

        test_calculate_new_commit_index!(commit_advances_past_first_entry_of_term, 12, 5, 11, vec![12, 12, 10]);
    }
}
