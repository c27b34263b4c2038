//! Replication stream.

pub(crate) mod snapshot_stream;

use std::sync::Arc;

use futures::future::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Instrument;

use crate::config::Config;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::Entry;
use crate::raft::InstallSnapshotRequest;
use crate::raft_types::LogId;
use crate::replication::snapshot_stream::SnapshotChunker;
use crate::storage::Snapshot;
use crate::storage::SnapshotMeta;
use crate::summary::MessageSummary;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::SnapshotPolicy;

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream<D: AppData> {
    /// The channel used for communicating with the replication task.
    ///
    /// The channel is bounded by `Config::replication_queue_capacity`; a leader awaiting
    /// capacity here is the back-pressure applied on behalf of a slow follower.
    pub repl_tx: mpsc::Sender<RaftEvent<D>>,
}

impl<D: AppData> ReplicationStream<D> {
    /// Create a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        raft_core_tx: mpsc::UnboundedSender<ReplicaEvent<S::SnapshotData>>,
    ) -> Self {
        ReplicationCore::spawn(id, target, term, config, last_log, commit_index, network, storage, raft_core_tx)
    }
}

/// A task responsible for sending replication events to a target follower in the Raft cluster.
///
/// NOTE: we do not pipeline replication requests to the target, as that could result in
/// out-of-order delivery. Exactly one RPC is in flight at a time; the reply for a given
/// prev_log_id is processed before the next request is built.
struct ReplicationCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    //////////////////////////////////////////////////////////////////////////
    // Static Fields /////////////////////////////////////////////////////////
    /// The ID of this Raft node.
    id: NodeId,
    /// The ID of the target Raft node which replication events are to be sent to.
    target: NodeId,
    /// The current term, which will never change during the lifetime of this task.
    term: u64,

    /// A channel for sending events to the Raft node.
    raft_core_tx: mpsc::UnboundedSender<ReplicaEvent<S::SnapshotData>>,
    /// A channel for receiving events from the Raft node.
    repl_rx: mpsc::Receiver<RaftEvent<D>>,

    /// The `RaftNetwork` interface.
    network: Arc<N>,
    /// The `RaftStorage` interface.
    storage: Arc<S>,
    /// The Raft's runtime config.
    config: Arc<Config>,

    marker_r: std::marker::PhantomData<R>,

    //////////////////////////////////////////////////////////////////////////
    // Dynamic Fields ////////////////////////////////////////////////////////
    /// The target state of this replication stream.
    target_state: TargetReplState,

    /// The index of the log entry to most recently be appended to the log by the leader.
    last_log_index: u64,
    /// The index of the highest log entry which is known to be committed in the cluster.
    commit_index: u64,

    /// The last log id known to be successfully replicated on the target.
    ///
    /// This Raft implementation also uses a _conflict optimization_ pattern for reducing the
    /// number of RPCs which need to be sent back and forth between a peer which is lagging
    /// behind, as defined in §5.3.
    matched: LogId,

    /// The heartbeat interval for ensuring that heartbeats are always delivered in a timely
    /// fashion.
    heartbeat: Interval,
    /// The timeout for sending a snapshot chunk.
    install_snapshot_timeout: Duration,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> ReplicationCore<D, R, N, S> {
    /// Spawn a new replication task for the target node.
    #[allow(clippy::too_many_arguments)]
    pub(self) fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        raft_core_tx: mpsc::UnboundedSender<ReplicaEvent<S::SnapshotData>>,
    ) -> ReplicationStream<D> {
        let (repl_tx, repl_rx) = mpsc::channel(config.replication_queue_capacity);
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let install_snapshot_timeout = Duration::from_millis(config.install_snapshot_timeout);

        let this = Self {
            id,
            target,
            term,
            network,
            storage,
            config,
            marker_r: std::marker::PhantomData,
            target_state: TargetReplState::LineRate,
            last_log_index: last_log.index,
            commit_index,
            matched: LogId::default(),
            raft_core_tx,
            repl_rx,
            heartbeat: interval(heartbeat_timeout),
            install_snapshot_timeout,
        };

        let _handle = tokio::spawn(this.main().instrument(tracing::debug_span!("replication", id = id, target = target)));

        ReplicationStream { repl_tx }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target, cluster=%self.config.cluster_name))]
    async fn main(mut self) {
        // Perform an initial heartbeat, which also establishes leadership with the target.
        self.send_append_entries().await;

        // Proceed to the replication stream's inner loop.
        loop {
            match &self.target_state {
                TargetReplState::LineRate => self.line_rate_loop().await,
                TargetReplState::Snapshotting => self.replicate_snapshot().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    /// Send an AppendEntries RPC to the target.
    ///
    /// This request will timeout if no response is received within the
    /// configured heartbeat interval.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) {
        let start = self.matched.index + 1;
        let end = self.last_log_index + 1;
        let chunk_size = std::cmp::min(self.config.max_payload_entries, end.saturating_sub(start));

        let logs = if chunk_size == 0 {
            // Just a heartbeat.
            vec![]
        } else {
            match self.load_log_entries(start, start + chunk_size).await {
                Some(logs) => logs,
                // State changed to snapshotting.
                None => return,
            }
        };
        let last_log_id = logs.last().map(|last| last.log_id);

        // Build the payload to be sent to the follower.
        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id: self.matched,
            leader_commit: self.commit_index,
            entries: logs,
        };

        // Send the payload.
        let res = timeout(
            Duration::from_millis(self.config.heartbeat_interval),
            self.network.send_append_entries(self.target, payload),
        )
        .await;

        let res = match res {
            Ok(outer_res) => match outer_res {
                Ok(res) => res,
                Err(err) => {
                    tracing::warn!(error=%err, "error sending AppendEntries RPC to target");
                    // Pace retries to the heartbeat cadence; an unreachable peer must not
                    // turn the replication loop into a hot spin.
                    tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval)).await;
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(error=%err, "timeout while sending AppendEntries RPC to target");
                return;
            }
        };

        // Handle success conditions.
        if res.success {
            // Only this request's entries are vouched for by the reply; prefer the follower's
            // reported match, falling back to the last entry sent.
            let new_matched = res.matched.or(last_log_id);
            if let Some(log_id) = new_matched {
                if log_id.index > self.matched.index {
                    self.matched = log_id;
                    self.update_matched();
                }
            }
            return;
        }

        // Replication was not successful, if a newer term has been returned, revert to follower.
        if res.term > self.term {
            tracing::debug!(res.term, "append entries failed, reverting to follower");
            let _ = self.raft_core_tx.send(ReplicaEvent::RevertToFollower {
                target: self.target,
                term: res.term,
            });
            self.set_target_state(TargetReplState::Shutdown);
            return;
        }

        // Replication was not successful; handle the conflict optimization record.
        let mut conflict = match res.conflict_opt {
            Some(conflict) => conflict,
            None => {
                // A rejection at this point should always carry a conflict hint; retry on the
                // next tick if it does not.
                tracing::warn!("append entries failed, but no conflict optimization record was returned");
                return;
            }
        };

        tracing::debug!(?conflict, res.term, "append entries failed, handling conflict opt");

        // If the conflict index is 0, the follower's log is empty relative to ours; restart
        // replication from the beginning.
        if conflict.log_id.index == 0 {
            self.matched = LogId::default();
            self.update_matched();
            return;
        }

        // The follower may report a conflict index beyond our own log when it holds a longer,
        // stale suffix. Clamp with a term that can never match so the matched index is not
        // reported upward from this exchange.
        if conflict.log_id.index > self.last_log_index {
            conflict.log_id = LogId {
                term: 0,
                index: self.last_log_index,
            };
        }

        // Fetch the entry at the conflict index and use the term specified there.
        let ent = match self.storage.try_get_log_entry(conflict.log_id.index).await {
            Ok(ent) => ent,
            Err(err) => {
                tracing::error!(error=%err, "error fetching log entry due to returned AppendEntries RPC conflict_opt");
                self.set_target_state(TargetReplState::Shutdown);
                let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                return;
            }
        };
        let ent = match ent {
            Some(ent) => ent,
            None => {
                // This condition would only ever be reached if the log has been removed due to
                // log compaction (barring critical storage failure), so transition to
                // snapshotting.
                self.set_target_state(TargetReplState::Snapshotting);
                return;
            }
        };

        // Next time, try sending from the conflict point. Only report the new matched index
        // upward when the follower's claimed term actually matches our entry there.
        let term = ent.log_id.term;
        self.matched = ent.log_id;
        if term == conflict.log_id.term {
            self.update_matched();
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, state: TargetReplState) {
        self.target_state = state;
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn update_matched(&mut self) {
        tracing::debug!(target = self.target, matched = %self.matched, "update_matched");
        let _ = self.raft_core_tx.send(ReplicaEvent::UpdateMatched {
            target: self.target,
            matched: self.matched,
        });
    }

    /// Perform a check to see if this replication stream is lagging behind far enough that a
    /// snapshot is warranted.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn needs_snapshot(&self) -> bool {
        match &self.config.snapshot_policy {
            SnapshotPolicy::LogsSinceLast(threshold) => {
                let needs_snap = self.commit_index.checked_sub(self.matched.index).map(|diff| diff >= *threshold).unwrap_or(false);
                tracing::trace!("snapshot needed: {}", needs_snap);
                needs_snap
            }
        }
    }

    /// Fully drain the channel coming in from the Raft node.
    pub(self) fn drain_raft_rx(&mut self, first: RaftEvent<D>) {
        let mut event_opt = Some(first);
        let mut iters = 0;
        loop {
            // Just ensure we don't get stuck draining a REALLY hot replication feed.
            if iters > self.config.max_payload_entries {
                return;
            }

            // Unpack the event opt, else return if we don't have one to process.
            let event = match event_opt.take() {
                Some(event) => event,
                None => return,
            };

            // Process the event.
            match event {
                RaftEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = commit_index;
                }
                RaftEvent::Replicate { entry, commit_index } => {
                    self.commit_index = commit_index;
                    self.last_log_index = entry.log_id.index;
                }
                RaftEvent::Terminate => {
                    self.set_target_state(TargetReplState::Shutdown);
                    return;
                }
            }

            // Attempt to unpack the next event for the next loop iteration.
            if let Some(event) = self.repl_rx.recv().now_or_never() {
                event_opt = event;
            }
            iters += 1;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The state of the replication stream.
#[derive(Debug, Eq, PartialEq)]
enum TargetReplState {
    /// The replication stream is running at line rate.
    LineRate,
    /// The replication stream is streaming a snapshot over to the target node.
    Snapshotting,
    /// The replication stream is shutting down.
    Shutdown,
}

/// An event from the Raft node.
pub(crate) enum RaftEvent<D: AppData> {
    Replicate {
        /// The new entry which needs to be replicated.
        ///
        /// This entry will always be the most recent entry to have been appended to the log,
        /// so its index is the new last_log_index value.
        entry: Arc<Entry<D>>,
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    /// A message from Raft indicating a new commit index value.
    UpdateCommitIndex {
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    Terminate,
}

/// An event coming from a replication stream.
pub(crate) enum ReplicaEvent<S> {
    /// An event from a replication stream which updates the target node's match index.
    UpdateMatched {
        /// The ID of the target node for which the match index is to be updated.
        target: NodeId,
        /// The id of the most recent log known to have been successfully replicated on the
        /// target.
        matched: LogId,
    },
    /// An event indicating that the Raft node needs to revert to follower state.
    RevertToFollower {
        /// The ID of the target node from which the new term was observed.
        target: NodeId,
        /// The new term observed.
        term: u64,
    },
    /// An event from a replication stream requesting snapshot info.
    NeedsSnapshot {
        /// The ID of the target node from which the event was sent.
        target: NodeId,
        /// The response channel for delivering the snapshot data.
        tx: oneshot::Sender<Snapshot<S>>,
    },
    /// Some critical error has taken place, and Raft needs to shutdown.
    Shutdown,
}

impl<S> MessageSummary for ReplicaEvent<S> {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::UpdateMatched { ref target, ref matched } => {
                format!("UpdateMatched: target: {}, matched: {}", target, matched)
            }
            ReplicaEvent::RevertToFollower { ref target, ref term } => {
                format!("RevertToFollower: target: {}, term: {}", target, term)
            }
            ReplicaEvent::NeedsSnapshot { ref target, .. } => {
                format!("NeedsSnapshot: target: {}", target)
            }
            ReplicaEvent::Shutdown => "Shutdown".to_string(),
        }
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> ReplicationCore<D, R, N, S> {
    #[tracing::instrument(level = "trace", skip(self), fields(state = "line-rate"))]
    pub async fn line_rate_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::LineRate {
                return;
            }

            if self.needs_snapshot() {
                self.set_target_state(TargetReplState::Snapshotting);
                return;
            }

            if self.matched.index < self.last_log_index {
                self.send_append_entries().await;

                if self.target_state != TargetReplState::LineRate {
                    return;
                }
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => {
                    self.send_append_entries().await;
                }
                event = self.repl_rx.recv() => {
                    match event {
                        Some(event) => self.drain_raft_rx(event),
                        None => {
                            self.set_target_state(TargetReplState::Shutdown);
                        }
                    }
                }
            }
        }
    }

    /// Ensure there are no gaps in the outbound buffer.
    ///
    /// Returns `None` (after switching to snapshot replication) if the needed entries are no
    /// longer retained in the log.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn load_log_entries(&mut self, start: u64, stop: u64) -> Option<Vec<Entry<D>>> {
        let entries = match self.storage.get_log_entries(start, stop).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::info!(error=%err, "loading log entries failed, switching to snapshot replication");
                self.set_target_state(TargetReplState::Snapshotting);
                return None;
            }
        };

        let first = entries.first().map(|x| x.log_id.index);
        if first != Some(start) {
            tracing::info!(
                entry = start,
                first = ?first,
                "entry to replicate not found, switching to snapshot replication"
            );
            self.set_target_state(TargetReplState::Snapshotting);
            return None;
        }

        Some(entries)
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "snapshotting"))]
    pub async fn replicate_snapshot(&mut self) {
        let snapshot = match self.wait_for_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::error!(error=%err, "replication stream shutting down while waiting for snapshot");
                return;
            }
        };

        if let Err(err) = self.stream_snapshot(snapshot).await {
            tracing::warn!(error=%err, "error streaming snapshot to target");
        }
    }

    /// Wait for a response from the storage layer for the current snapshot.
    ///
    /// If an error comes up during processing, this routine should simply be called again
    /// after issuing a new request to the storage layer.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn wait_for_snapshot(&mut self) -> Result<Snapshot<S::SnapshotData>, RaftError> {
        // Ask the raft core for a snapshot:
        // - if it has one on hand it is sent back through tx;
        // - otherwise it starts capturing one and **closes** `tx` when finished, in which case
        //   the request must be re-sent.
        loop {
            let (tx, mut rx) = oneshot::channel();
            if self.raft_core_tx.send(ReplicaEvent::NeedsSnapshot { target: self.target, tx }).is_err() {
                self.set_target_state(TargetReplState::Shutdown);
                return Err(RaftError::ShuttingDown);
            }

            let mut waiting_for_snapshot = true;
            while waiting_for_snapshot {
                tokio::select! {
                    _ = self.heartbeat.tick() => self.send_append_entries().await,

                    event = self.repl_rx.recv() => {
                        match event {
                            Some(event) => self.drain_raft_rx(event),
                            None => {
                                self.set_target_state(TargetReplState::Shutdown);
                                return Err(RaftError::ShuttingDown);
                            }
                        }
                        if self.target_state == TargetReplState::Shutdown {
                            return Err(RaftError::ShuttingDown);
                        }
                    },

                    res = &mut rx => {
                        match res {
                            Ok(snapshot) => return Ok(snapshot),
                            Err(_) => {
                                // The channel was closed to signal that an in-progress
                                // snapshot has completed; re-send the request.
                                waiting_for_snapshot = false;
                            }
                        }
                    },
                }
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn stream_snapshot(&mut self, snapshot: Snapshot<S::SnapshotData>) -> RaftResult<()> {
        let chunk_size = self.config.snapshot_max_chunk_size;
        let mut chunker = SnapshotChunker::open(snapshot.snapshot, chunk_size).await?;
        let meta = SnapshotMeta {
            last_log_id: snapshot.meta.last_log_id,
            snapshot_id: snapshot.meta.snapshot_id.clone(),
            total_len: chunker.total_len(),
            chunk_size,
        };

        loop {
            let chunk_index = chunker.chunk_index();
            let data = chunker.read_current_chunk().await?;
            let done = chunker.is_last_chunk(chunk_index);
            let req = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.id,
                meta: meta.clone(),
                chunk_index,
                data,
                done,
            };

            tracing::debug!(
                chunk = chunk_index,
                total = chunker.total_chunks(),
                len = req.data.len(),
                done,
                "sending snapshot chunk"
            );

            let res = timeout(
                self.install_snapshot_timeout,
                self.network.send_install_snapshot(self.target, req),
            )
            .await;

            let res = match res {
                Ok(outer_res) => match outer_res {
                    Ok(res) => res,
                    Err(err) => {
                        // Retry the same chunk; the cursor has not advanced.
                        tracing::warn!(error=%err, "error sending InstallSnapshot RPC to target");
                        tokio::time::sleep(self.install_snapshot_timeout).await;
                        continue;
                    }
                },
                Err(err) => {
                    tracing::warn!(error=%err, "timeout while sending InstallSnapshot RPC to target");
                    continue;
                }
            };

            // Handle response conditions.
            if res.term > self.term {
                let _ = self.raft_core_tx.send(ReplicaEvent::RevertToFollower {
                    target: self.target,
                    term: res.term,
                });
                self.set_target_state(TargetReplState::Shutdown);
                return Ok(());
            }

            if !res.success {
                // The follower lost its streaming state (e.g. it restarted); rewind to the
                // first chunk.
                tracing::info!(chunk = chunk_index, "snapshot chunk rejected by target, rewinding stream");
                chunker.rewind();
                continue;
            }

            // If we just sent the final chunk of the snapshot, then transition to line-rate.
            if done {
                self.set_target_state(TargetReplState::LineRate);

                tracing::debug!(
                    "done install snapshot: snapshot last_log_id: {}, matched: {}",
                    meta.last_log_id,
                    self.matched,
                );

                if meta.last_log_id > self.matched {
                    self.matched = meta.last_log_id;
                    self.update_matched();
                }
                return Ok(());
            }

            // The chunk was acknowledged; advance the cursor.
            chunker.advance();

            // Check the raft channel to ensure we are staying up-to-date, then loop.
            if let Some(Some(event)) = self.repl_rx.recv().now_or_never() {
                self.drain_raft_rx(event);
            }
        }
    }
}
