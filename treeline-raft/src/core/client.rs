use std::sync::Arc;

use crate::core::LeaderState;
use crate::error::{ClientWriteError, RaftResult};
use crate::raft::{ClientWriteRequest, ClientWriteResponse, ClientWriteResponseTx, Entry, EntryPayload};
use crate::raft_types::LogId;
use crate::replication::RaftEvent;
use crate::{AppData, AppDataResponse, RaftNetwork, RaftStorage};

/// A wrapper around a ClientWriteRequest which has been transformed into an Entry, along with
/// its response channel.
pub(super) struct ClientRequestEntry<D: AppData, R: AppDataResponse> {
    /// The Arc'd entry of the request.
    ///
    /// This value is Arc'd so that it may be sent across thread boundaries for replication
    /// without having to clone the data payload itself.
    pub entry: Arc<Entry<D>>,
    /// The response channel for the request, if it came from a client.
    ///
    /// Internal entries (the blank entry committed on taking office) carry no channel.
    pub tx: Option<ClientWriteResponseTx<D, R>>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Commit the initial entry which new leaders are obligated to create when first coming to
    /// power, per §8.
    ///
    /// This entry is the first of the leader's own term, and is the entry through which any
    /// entries surviving from previous terms become committed: transitively, never directly.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let req = ClientWriteRequest::<D>::new_blank_payload();
        let entry = self.append_payload_to_log(req.entry).await?;
        self.first_index_of_term = entry.log_id.index;
        let cr_entry = ClientRequestEntry {
            entry: Arc::new(entry),
            tx: None,
        };
        self.replicate_client_request(cr_entry).await;
        self.core.report_metrics();
        Ok(())
    }

    /// Handle client write requests.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(&mut self, rpc: ClientWriteRequest<D>, tx: ClientWriteResponseTx<D, R>) {
        let entry = match self.append_payload_to_log(rpc.entry).await {
            Ok(entry) => ClientRequestEntry {
                entry: Arc::new(entry),
                tx: Some(tx),
            },
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                return;
            }
        };
        self.replicate_client_request(entry).await;
    }

    /// Transform the given payload into an entry, assign an index and term, and append the
    /// entry to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload<D>) -> RaftResult<Entry<D>> {
        let entry = Entry {
            log_id: LogId::new(self.core.current_term, self.core.log.last_log_id.index + 1),
            payload,
        };
        self.core
            .storage
            .append_entry_to_log(&entry)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.log.last_log_id = entry.log_id;
        Ok(entry)
    }

    /// Begin the process of replicating the given client request.
    ///
    /// NOTE WELL: this routine does not wait for the request to actually finish replication, it
    /// merely begins the process. Once the request is committed to the cluster, its response
    /// will be generated asynchronously.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry<D, R>) {
        let entry_arc = req.entry.clone();
        if !self.nodes.is_empty() {
            self.awaiting_committed.push(req);
            for node in self.nodes.values() {
                let _ = node
                    .replstream
                    .repl_tx
                    .send(RaftEvent::Replicate {
                        entry: entry_arc.clone(),
                        commit_index: self.core.log.committed,
                    })
                    .await;
            }
        } else {
            // There are no other voting nodes, so the payload is committed the moment it is
            // appended.
            self.core.log.committed = entry_arc.log_id.index;
            self.core.report_metrics();
            self.client_request_post_commit(req).await;
        }
    }

    /// Handle the post-commit logic for a client request.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry<D, R>) {
        let entry = &req.entry;
        match (&entry.payload, req.tx) {
            (EntryPayload::Normal(inner), Some(tx)) => {
                match self.apply_entry_to_state_machine(&entry.log_id, &inner.data).await {
                    Ok(data) => {
                        let _ = tx.send(Ok(ClientWriteResponse {
                            log_id: entry.log_id,
                            data,
                        }));
                    }
                    Err(err) => {
                        let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                    }
                }
            }
            _ => {
                // Internal entries only advance the applied cursor.
                if let Err(err) = self.apply_outstanding_to_state_machine(entry.log_id.index).await {
                    tracing::error!(error=%err, "error applying outstanding entries to state machine");
                }
            }
        }
        self.core.report_metrics();

        // Trigger log compaction if needed.
        self.core.trigger_log_compaction_if_needed(false);
    }

    /// Apply all committed entries through `through` which have not yet reached the state
    /// machine.
    async fn apply_outstanding_to_state_machine(&mut self, through: u64) -> RaftResult<()> {
        if through <= self.core.log.last_applied {
            return Ok(());
        }
        let entries = self
            .core
            .storage
            .get_log_entries(self.core.log.last_applied + 1, through + 1)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        let data_entries: Vec<_> = entries
            .iter()
            .filter_map(|entry| match &entry.payload {
                EntryPayload::Normal(inner) => Some((&entry.log_id, &inner.data)),
                _ => None,
            })
            .collect();
        if !data_entries.is_empty() {
            self.core
                .storage
                .replicate_to_state_machine(&data_entries)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;
        }
        self.core.log.last_applied = through;
        Ok(())
    }

    /// Apply the given log entry to the state machine, catching up any outstanding entries
    /// before it.
    ///
    /// Outstanding entries would only exist if this node had unapplied committed logs from
    /// before becoming leader.
    #[tracing::instrument(level = "trace", skip(self, data))]
    pub(super) async fn apply_entry_to_state_machine(&mut self, log_id: &LogId, data: &D) -> RaftResult<R> {
        self.apply_outstanding_to_state_machine(log_id.index - 1).await?;
        let res = self
            .core
            .storage
            .apply_entry_to_state_machine(log_id, data)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.log.last_applied = log_id.index;
        Ok(res)
    }
}
