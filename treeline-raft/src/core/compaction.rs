//! Snapshot capture and log compaction management.

use futures::future::{AbortHandle, Abortable};
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::core::RaftCore;
use crate::raft_types::{LogId, SnapshotId};
use crate::{AppData, AppDataResponse, RaftNetwork, RaftStorage, SnapshotPolicy};

/// The current snapshot state of the Raft node.
pub(crate) enum SnapshotState<S> {
    /// The Raft node is compacting itself.
    Snapshotting {
        /// A handle to abort the compaction process early if needed.
        handle: AbortHandle,
        /// A sender for notifying any other tasks of the completion of this compaction.
        sender: broadcast::Sender<u64>,
    },
    /// The Raft node is streaming in a snapshot from the leader.
    Streaming {
        /// The ID of the snapshot object being written.
        snapshot_id: SnapshotId,
        /// The offset of the last byte written to the snapshot.
        offset: u64,
        /// The chunk index expected next.
        chunk_index: u64,
        /// A handle to the snapshot writer.
        snapshot: Box<S>,
    },
}

/// An update on a snapshot creation process.
#[derive(Debug)]
pub(crate) enum SnapshotUpdate {
    /// Snapshot creation has finished successfully and covers the given log id.
    SnapshotComplete(LogId),
    /// Snapshot creation failed.
    ///
    /// The in-progress snapshot is discarded and the journal is left untouched; a partial trim
    /// is never performed.
    SnapshotFailed,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Trigger a log compaction (snapshot) job if needed.
    ///
    /// With `force=false` this captures when the log has grown past the configured policy
    /// threshold since the last snapshot. With `force=true` (capture-to-install) the threshold
    /// is bypassed: a follower needs a snapshot because its required log prefix no longer
    /// exists.
    ///
    /// Capture runs on its own task, off the replication path, so heartbeats and AppendEntries
    /// continue to be serviced while a large snapshot is produced. Only the completion message
    /// re-enters the sequential processing stream, via the compaction channel.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn trigger_log_compaction_if_needed(&mut self, force: bool) {
        if self.snapshot_state.is_some() {
            return;
        }
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        // Check to ensure we have actual entries for compaction.
        if self.log.last_applied == 0 || self.log.last_applied < self.log.snapshot_last_log_id.index {
            return;
        }
        if !force {
            // If we are below the threshold, then there is nothing to do.
            let is_below_threshold = self
                .log
                .last_applied
                .checked_sub(self.log.snapshot_last_log_id.index)
                .map(|diff| diff < *threshold)
                .unwrap_or(false);
            if is_below_threshold {
                return;
            }
        }

        // The snapshot never covers an uncommitted entry; the trim point is clamped and the
        // actual index used may be lower than the applied cursor requested.
        let through = calc_trim_index(self.log.last_applied, self.log.committed);
        if through == 0 {
            return;
        }

        // At this point, we are clear to begin a new compaction process.
        let storage = self.storage.clone();
        let (handle, reg) = AbortHandle::new_pair();
        let (chan_tx, _) = broadcast::channel(1);
        let tx_compaction = self.tx_compaction.clone();
        self.snapshot_state = Some(SnapshotState::Snapshotting {
            handle,
            sender: chan_tx.clone(),
        });
        tokio::spawn(
            async move {
                let res = Abortable::new(storage.do_log_compaction(through), reg).await;
                match res {
                    Ok(res) => match res {
                        Ok(snapshot) => {
                            let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotComplete(snapshot.meta.last_log_id));
                            let _ = chan_tx.send(snapshot.meta.last_log_id.index); // This will always succeed.
                        }
                        Err(err) => {
                            tracing::error!(error=%err, "error while generating snapshot");
                            let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                        }
                    },
                    Err(_aborted) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                }
            }
            .instrument(tracing::debug_span!("beginning new log compaction process")),
        );
    }

    /// Update the system's snapshot state based on the given data.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn update_snapshot_state(&mut self, update: SnapshotUpdate) {
        if let SnapshotUpdate::SnapshotComplete(log_id) = update {
            self.log.snapshot_last_log_id = log_id;
            self.report_metrics();
        }
        // If snapshot state is anything other than streaming, then drop it.
        if let Some(state @ SnapshotState::Streaming { .. }) = self.snapshot_state.take() {
            self.snapshot_state = Some(state);
        }
    }
}

/// Clamp a desired log trim index so it never reaches an uncommitted entry.
///
/// Callers must use the returned index, which may be lower than requested.
pub(crate) fn calc_trim_index(desired: u64, committed: u64) -> u64 {
    std::cmp::min(desired, committed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_index_is_clamped_to_committed() {
        assert_eq!(calc_trim_index(100, 50), 50);
        assert_eq!(calc_trim_index(50, 100), 50);
        assert_eq!(calc_trim_index(0, 100), 0);
        assert_eq!(calc_trim_index(100, 0), 0);
    }
}
