//! The Raft storage interface and data types.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

use crate::raft::{Entry, MembershipConfig};
use crate::raft_types::{LogId, SnapshotId};
use crate::{AppData, AppDataResponse, NodeId};

/// The metadata of a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// The id of the last log entry covered by this snapshot.
    pub last_log_id: LogId,
    /// The unique id of this snapshot.
    pub snapshot_id: SnapshotId,
    /// The total byte length of the snapshot data.
    ///
    /// Snapshots of a large data tree routinely exceed 32-bit lengths; all offset and chunk
    /// arithmetic on this value is 64-bit.
    pub total_len: u64,
    /// The chunk size the leader uses when streaming this snapshot.
    pub chunk_size: u64,
}

/// The data associated with the current snapshot: its metadata plus a handle for reading
/// (leader side) or writing (installing follower side) its bytes.
pub struct Snapshot<S> {
    /// Metadata of the snapshot.
    pub meta: SnapshotMeta,
    /// A handle to the associated snapshot data.
    pub snapshot: Box<S>,
}

/// A record holding the hard state of a Raft node.
///
/// This model derives serde's traits for easily (de)serializing this
/// model for storage & retrieval.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
    /// The cluster membership configuration.
    pub membership: MembershipConfig,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The id of the last entry in the log.
    pub last_log_id: LogId,
    /// The index of the last log applied to the state machine.
    pub last_applied_log: u64,
    /// The saved hard state of the node.
    pub hard_state: HardState,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            last_log_id: LogId::default(),
            last_applied_log: 0,
            hard_state: HardState {
                current_term: 0,
                voted_for: None,
                membership: MembershipConfig::new_initial(id),
            },
        }
    }
}

/// A trait defining the interface for a Raft storage system.
///
/// This is the persistence provider seam: the consensus core depends on this interface for
/// durability of log entries, hard state and snapshots, but does not implement any storage
/// medium specifics itself. Errors returned from these methods on the consensus path are
/// treated as fatal for the replica: a node that cannot write durably cannot safely
/// participate in consensus, so the core shuts down rather than continue.
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// The storage engine's associated type used for exposing a snapshot for reading & writing.
    type SnapshotData: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static;

    /// A request from Raft to get Raft's state information from storage.
    ///
    /// When the Raft node is first started, it will call this interface on the storage system to
    /// fetch the last known state from stable storage. If no such entry exists due to being the
    /// first time the node has come online, then `InitialState::new_initial` should be used.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// A request from Raft to save its hard state.
    ///
    /// The hard state must be durable before this returns: a node which votes, loses the vote
    /// record in a crash, and votes again in the same term breaks election safety.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// A request from Raft to get a series of log entries from storage.
    ///
    /// The start value is inclusive in the search and the stop value is non-inclusive:
    /// `[start, stop)`. Entries below the journal's first retained index (compacted away by a
    /// snapshot) must produce an error, which the replication layer takes as the signal to
    /// switch that follower to snapshot replication.
    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry<D>>>;

    /// A request from Raft to get a single log entry, if it is retained.
    async fn try_get_log_entry(&self, index: u64) -> Result<Option<Entry<D>>>;

    /// Delete the log entry at `start` and everything after it.
    ///
    /// This is only ever invoked to remove a follower's conflicting, uncommitted log suffix.
    /// Trimming from the front of the log is the business of log compaction, never of this
    /// method.
    async fn delete_logs_from(&self, start: u64) -> Result<()>;

    /// A request from Raft to append a new entry to the log.
    async fn append_entry_to_log(&self, entry: &Entry<D>) -> Result<()>;

    /// A request from Raft to replicate a payload of entries to the log.
    ///
    /// Though the entries will always be presented in order, each entry's index should be used to
    /// determine its location to be written in the log, as logs may need to be overwritten under
    /// some circumstances.
    async fn replicate_to_log(&self, entries: &[Entry<D>]) -> Result<()>;

    /// A request from Raft to apply the given log entry to the state machine.
    ///
    /// This handler is called as part of the client request path. Client requests which are
    /// configured to respond after they have been applied will wait until after this handler
    /// returns before issuing a response to the client request.
    ///
    /// The Raft protocol guarantees that only logs which have been _committed_, that is, logs
    /// which have been replicated to a majority of the cluster, will be applied to the state
    /// machine.
    async fn apply_entry_to_state_machine(&self, log_id: &LogId, data: &D) -> Result<R>;

    /// A request from Raft to apply the given payload of entries to the state machine, as part
    /// of replication.
    async fn replicate_to_state_machine(&self, entries: &[(&LogId, &D)]) -> Result<()>;

    /// A request from Raft to perform log compaction, returning a handle to the generated
    /// snapshot.
    ///
    /// The snapshot should cover all entries from the start of the log through the entry at
    /// `through`, inclusively, which will never exceed the commit index. The snapshot must be
    /// durably persisted **before** any journal entries are trimmed; a crash in between must
    /// leave either the snapshot absent with the log intact, or the snapshot present with the
    /// log trimmed, never a trimmed log without a snapshot.
    async fn do_log_compaction(&self, through: u64) -> Result<Snapshot<Self::SnapshotData>>;

    /// Create a new blank snapshot, returning a writable handle to the snapshot object along
    /// with the id of the snapshot.
    ///
    /// The snapshot object returned here is for a follower receiving a snapshot stream from the
    /// leader; its bytes arrive chunk by chunk through the InstallSnapshot RPC.
    async fn create_snapshot(&self) -> Result<(SnapshotId, Box<Self::SnapshotData>)>;

    /// Finalize the installation of a snapshot which has finished streaming from the cluster
    /// leader.
    ///
    /// Delete all entries in the log through `delete_through`, unless `None`, in which case
    /// all entries of the log are to be deleted. All other snapshots should be deleted at this
    /// point.
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
        delete_through: Option<u64>,
    ) -> Result<()>;

    /// A request from Raft to get a readable handle to the current snapshot, along with its
    /// metadata.
    ///
    /// A proper implementation will only ever have one active snapshot, though another may
    /// exist while it is being created; a partially written snapshot must never be returned
    /// from this method.
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>>;
}
