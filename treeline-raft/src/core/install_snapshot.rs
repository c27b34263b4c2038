use std::io::SeekFrom;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::core::compaction::SnapshotState;
use crate::core::{RaftCore, State, UpdateCurrentLeader};
use crate::error::RaftResult;
use crate::raft::{InstallSnapshotRequest, InstallSnapshotResponse};
use crate::raft_types::SnapshotId;
use crate::{AppData, AppDataResponse, RaftNetwork, RaftStorage};

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Invoked by the leader to send chunks of a snapshot to a follower (§7).
    ///
    /// Leaders always send chunks in order. The follower tracks the chunk index it expects
    /// next; an out-of-order chunk is rejected (not an error) and the leader rewinds. A log
    /// may only have one snapshot at any time.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn handle_install_snapshot_request(&mut self, req: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                success: false,
            });
        }

        // Update election timeout.
        self.update_next_election_timeout(true);

        // Update current term if needed.
        if self.current_term != req.term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
        }

        // Update current leader if needed.
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
        }

        // If not follower, become follower.
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }

        // Compare current snapshot state with received RPC and handle as needed.
        match self.snapshot_state.take() {
            None => self.begin_installing_snapshot(req).await,
            Some(SnapshotState::Snapshotting { handle, .. }) => {
                // Abort the local compaction in favor of installation from the leader.
                handle.abort();
                self.begin_installing_snapshot(req).await
            }
            Some(SnapshotState::Streaming {
                snapshot_id,
                offset,
                chunk_index,
                snapshot,
            }) => self.continue_installing_snapshot(req, snapshot_id, offset, chunk_index, snapshot).await,
        }
    }

    #[tracing::instrument(level = "trace", skip(self, req))]
    async fn begin_installing_snapshot(&mut self, req: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        // A transfer must start from its first chunk; a mid-stream chunk for a transfer we
        // have no state for means this replica restarted. Reject so the leader rewinds.
        if req.chunk_index != 0 {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                success: false,
            });
        }

        // Create a new snapshot and begin writing its contents.
        let (snapshot_id, mut snapshot) = self
            .storage
            .create_snapshot()
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        snapshot.as_mut().write_all(&req.data).await?;

        // If this was a small snapshot, and it is already done, then finish up.
        if req.done {
            self.finalize_snapshot_installation(req, snapshot).await?;
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                success: true,
            });
        }

        // Else, retain snapshot components for later chunks & respond.
        self.snapshot_state = Some(SnapshotState::Streaming {
            snapshot_id,
            offset: req.data.len() as u64,
            chunk_index: 1,
            snapshot,
        });
        Ok(InstallSnapshotResponse {
            term: self.current_term,
            success: true,
        })
    }

    #[tracing::instrument(level = "trace", skip(self, req, snapshot))]
    async fn continue_installing_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
        snapshot_id: SnapshotId,
        mut offset: u64,
        expected_chunk: u64,
        mut snapshot: Box<S::SnapshotData>,
    ) -> RaftResult<InstallSnapshotResponse> {
        if req.chunk_index != expected_chunk {
            // Chunks are fixed-size, so the incoming index implies its byte offset. A chunk
            // from beyond what we have written cannot be accepted; reject so the leader
            // rewinds. A repeated earlier chunk is re-seeked and overwritten.
            let target_offset = req.chunk_index.saturating_mul(req.meta.chunk_size);
            if target_offset > offset {
                self.snapshot_state = Some(SnapshotState::Streaming {
                    snapshot_id,
                    offset,
                    chunk_index: expected_chunk,
                    snapshot,
                });
                return Ok(InstallSnapshotResponse {
                    term: self.current_term,
                    success: false,
                });
            }
            if let Err(err) = snapshot.as_mut().seek(SeekFrom::Start(target_offset)).await {
                self.snapshot_state = Some(SnapshotState::Streaming {
                    snapshot_id,
                    offset,
                    chunk_index: expected_chunk,
                    snapshot,
                });
                return Err(err.into());
            }
            offset = target_offset;
        }

        // Write the next chunk & update offset.
        if let Err(err) = snapshot.as_mut().write_all(&req.data).await {
            self.snapshot_state = Some(SnapshotState::Streaming {
                snapshot_id,
                offset,
                chunk_index: req.chunk_index,
                snapshot,
            });
            return Err(err.into());
        }
        offset += req.data.len() as u64;

        // If the snapshot stream is done, then finalize.
        if req.done {
            self.finalize_snapshot_installation(req, snapshot).await?;
        } else {
            self.snapshot_state = Some(SnapshotState::Streaming {
                snapshot_id,
                offset,
                chunk_index: req.chunk_index + 1,
                snapshot,
            });
        }
        Ok(InstallSnapshotResponse {
            term: self.current_term,
            success: true,
        })
    }

    /// Finalize the installation of a new snapshot.
    ///
    /// Any errors which come up from this routine will cause the Raft node to go into shutdown.
    #[tracing::instrument(level = "trace", skip(self, req, snapshot))]
    async fn finalize_snapshot_installation(&mut self, req: InstallSnapshotRequest, mut snapshot: Box<S::SnapshotData>) -> RaftResult<()> {
        snapshot.as_mut().shutdown().await?;
        let delete_through = if self.log.last_log_id.index > req.meta.last_log_id.index {
            Some(req.meta.last_log_id.index)
        } else {
            None
        };
        self.storage
            .finalize_snapshot_installation(&req.meta, snapshot, delete_through)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        // The snapshot replaces everything at or below its last covered entry.
        if req.meta.last_log_id > self.log.last_log_id {
            self.log.last_log_id = req.meta.last_log_id;
        }
        self.log.snapshot_last_log_id = req.meta.last_log_id;
        if req.meta.last_log_id.index > self.log.committed {
            self.log.committed = req.meta.last_log_id.index;
        }
        if req.meta.last_log_id.index > self.log.last_applied {
            self.log.last_applied = req.meta.last_log_id.index;
        }
        self.report_metrics();
        Ok(())
    }
}
