use crate::core::{RaftCore, State, UpdateCurrentLeader};
use crate::error::RaftResult;
use crate::raft::{AppendEntriesRequest, AppendEntriesResponse, ConflictOpt, Entry, EntryPayload};
use crate::raft_types::LogId;
use crate::{AppData, AppDataResponse, RaftNetwork, RaftStorage};

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    #[tracing::instrument(
        level="trace", skip(self, msg),
        fields(term=msg.term, leader_id=msg.leader_id, prev_log_id=%msg.prev_log_id, leader_commit=msg.leader_commit),
    )]
    pub(super) async fn handle_append_entries_request(&mut self, msg: AppendEntriesRequest<D>) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if msg.term < self.current_term {
            tracing::trace!(self.current_term, rpc_term = msg.term, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                matched: None,
                conflict_opt: None,
            });
        }

        // Update election timeout.
        self.update_next_election_timeout(true);
        let mut report_metrics = false;

        // Update current term if needed.
        if self.current_term != msg.term {
            self.update_current_term(msg.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        // Update current leader if needed.
        if self.current_leader != Some(msg.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(msg.leader_id));
            report_metrics = true;
        }

        // Transition to follower state if needed.
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }

        /////////////////////////////////////
        //// Begin Log Consistency Check ////

        if !self.has_matching_prev_entry(&msg.prev_log_id).await? {
            let conflict_opt = self.build_conflict_opt(&msg.prev_log_id).await?;
            tracing::debug!(?conflict_opt, "rejecting AppendEntries, log consistency check failed");
            if report_metrics {
                self.report_metrics();
            }
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                matched: None,
                conflict_opt: Some(conflict_opt),
            });
        }

        ///////////////////////////////////
        //// End Log Consistency Check ////

        let last_new = msg.entries.last().map(|entry| entry.log_id).unwrap_or(msg.prev_log_id);
        if !msg.entries.is_empty() {
            self.append_log_entries(msg.prev_log_id, &msg.entries).await?;
            report_metrics = true;
        }

        // The commit index never runs ahead of what this exchange has verified to be present
        // locally (§5.3): min(leader_commit, index of last new entry).
        let new_commit = std::cmp::min(msg.leader_commit, last_new.index);
        if new_commit > self.log.committed {
            self.log.committed = new_commit;
        }
        self.replicate_to_state_machine_if_needed(&mut report_metrics).await?;

        // Fold the observed leader commit into the follower's sync status.
        if self.sync.update(msg.leader_id, msg.leader_commit, self.log.committed).is_some() {
            report_metrics = true;
        }

        if report_metrics {
            self.report_metrics();
        }
        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            matched: Some(last_new),
            conflict_opt: None,
        })
    }

    /// Check that the local log contains `prev_log_id` (the log matching property).
    async fn has_matching_prev_entry(&mut self, prev_log_id: &LogId) -> RaftResult<bool> {
        // An index of 0 means the leader is replicating from the very start of its log.
        if prev_log_id.index == 0 {
            return Ok(true);
        }
        // Entries compacted into the snapshot are committed, and committed entries match by
        // definition.
        if prev_log_id.index < self.log.snapshot_last_log_id.index {
            return Ok(true);
        }
        if prev_log_id.index == self.log.snapshot_last_log_id.index && self.log.snapshot_last_log_id.index != 0 {
            return Ok(prev_log_id.term == self.log.snapshot_last_log_id.term);
        }
        let entry = self
            .storage
            .try_get_log_entry(prev_log_id.index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(match entry {
            Some(entry) => entry.log_id.term == prev_log_id.term,
            None => false,
        })
    }

    /// Build the conflict optimization record for a failed log consistency check (§5.3).
    async fn build_conflict_opt(&mut self, prev_log_id: &LogId) -> RaftResult<ConflictOpt> {
        // If the entry is simply absent, the leader must back off to our last known id.
        if prev_log_id.index > self.log.last_log_id.index {
            return Ok(ConflictOpt {
                log_id: self.log.last_log_id,
            });
        }
        // The entry is present but its term conflicts. Look back a bounded distance for the
        // first local entry still in the leader's claimed term, so the leader can jump its
        // next_index there instead of decrementing one entry at a time.
        let start = std::cmp::max(
            prev_log_id.index.saturating_sub(50),
            self.log.snapshot_last_log_id.index + 1,
        );
        if start >= prev_log_id.index {
            return Ok(ConflictOpt {
                log_id: self.log.last_log_id,
            });
        }
        let old_entries = self
            .storage
            .get_log_entries(start, prev_log_id.index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        match old_entries.iter().find(|entry| entry.log_id.term == prev_log_id.term) {
            Some(entry) => Ok(ConflictOpt { log_id: entry.log_id }),
            None => Ok(ConflictOpt {
                log_id: self.log.last_log_id,
            }),
        }
    }

    /// Append the given entries to the log, skipping entries already present and truncating
    /// any conflicting suffix first (§5.3).
    ///
    /// Re-delivery of an already-applied request is a no-op here: every entry of the request
    /// matching an existing `(index, term)` pair is skipped, so nothing is re-appended and
    /// nothing is truncated.
    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_log_entries(&mut self, prev_log_id: LogId, entries: &[Entry<D>]) -> RaftResult<()> {
        let mut entries = entries;
        let mut last_matched = prev_log_id;

        // Entries at or below the snapshot boundary are committed and already covered.
        while let Some(entry) = entries.first() {
            if entry.log_id.index <= self.log.snapshot_last_log_id.index {
                last_matched = entry.log_id;
                entries = &entries[1..];
            } else {
                break;
            }
        }
        if entries.is_empty() {
            return Ok(());
        }

        let first = entries[0].log_id.index;
        let stop = entries[entries.len() - 1].log_id.index + 1;
        let existing = self
            .storage
            .get_log_entries(first, std::cmp::min(stop, self.log.last_log_id.index + 1))
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        // Find the first entry not already present, truncating a conflicting suffix if one
        // exists.
        let mut skip = 0usize;
        let mut truncate_at: Option<u64> = None;
        for (i, entry) in entries.iter().enumerate() {
            match existing.get(i) {
                Some(local) if local.log_id == entry.log_id => {
                    last_matched = entry.log_id;
                    skip = i + 1;
                }
                Some(local) => {
                    truncate_at = Some(local.log_id.index);
                    break;
                }
                None => break,
            }
        }

        if let Some(index) = truncate_at {
            // A conflicting suffix must never reach committed entries; that would be log
            // corruption, and the replica stops rather than repairs.
            if let Err(err) = self.log.assert_truncatable(index) {
                tracing::error!(error=%err, index, "conflicting entry below the committed boundary, shutting down");
                self.set_target_state(State::Shutdown);
                return Err(err);
            }
            tracing::info!(from = index, "removing conflicting log suffix");
            self.storage
                .delete_logs_from(index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            self.log.last_log_id = last_matched;
        }

        let to_append = &entries[skip..];
        if !to_append.is_empty() {
            self.storage
                .replicate_to_log(to_append)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            if let Some(entry) = to_append.last() {
                self.log.last_log_id = entry.log_id;
            }
        }
        Ok(())
    }

    /// Replicate outstanding committed logs to the state machine if needed.
    #[tracing::instrument(level = "trace", skip(self, report_metrics))]
    pub(super) async fn replicate_to_state_machine_if_needed(&mut self, report_metrics: &mut bool) -> RaftResult<()> {
        if self.log.committed > self.log.last_applied {
            let stop = std::cmp::min(self.log.committed, self.log.last_log_id.index) + 1;
            let entries = self
                .storage
                .get_log_entries(self.log.last_applied + 1, stop)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            if let Some(entry) = entries.last() {
                self.log.last_applied = entry.log_id.index;
                *report_metrics = true;
            }
            let data_entries: Vec<_> = entries
                .iter()
                .filter_map(|entry| match &entry.payload {
                    EntryPayload::Normal(inner) => Some((&entry.log_id, &inner.data)),
                    _ => None,
                })
                .collect();
            if !data_entries.is_empty() {
                self.storage
                    .replicate_to_state_machine(&data_entries)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
            }

            // Request async compaction, if needed.
            self.trigger_log_compaction_if_needed(false);
        }
        Ok(())
    }
}
