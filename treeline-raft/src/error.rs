//! Error types exposed by this crate.

use std::fmt;

use thiserror::Error;

use crate::{AppData, NodeId};

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the `RaftStorage` layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error which has come from the `RaftNetwork` layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
    /// A request would have truncated the log below the committed boundary.
    ///
    /// Committed entries are owned by the cluster, not by any single replica; a truncation
    /// reaching them means the replica's state is inconsistent with what it has acknowledged.
    /// This is an invariant violation and stops the replica.
    #[error("refusing to truncate the log from index {index}: committed through {committed}")]
    CommittedLogTruncation { index: u64, committed: u64 },
    /// An internal Raft error indicating that Raft is shutting down.
    #[error("Raft is shutting down")]
    ShuttingDown,
}

impl From<tokio::io::Error> for RaftError {
    fn from(src: tokio::io::Error) -> Self {
        RaftError::RaftStorage(src.into())
    }
}

/// An error related to a client write request.
#[derive(Error)]
pub enum ClientWriteError<D: AppData> {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client write request must be forwarded to the cluster leader.
    #[error("the client write request must be forwarded to the cluster leader")]
    ForwardToLeader(D, Option<NodeId>),
}

impl<D: AppData> fmt::Debug for ClientWriteError<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientWriteError::RaftError(err) => f.debug_tuple("RaftError").field(err).finish(),
            ClientWriteError::ForwardToLeader(_req, node_id) => f.debug_tuple("ForwardToLeader").field(node_id).finish(),
        }
    }
}

/// Error variants related to configuration.
#[derive(Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The given values for election timeout min & max are invalid: max must be greater than min.
    #[error("given values for election timeout min & max are invalid: max must be greater than min")]
    InvalidElectionTimeoutMinMax,
    /// The heartbeat interval must be strictly less than the election timeout minimum, else
    /// followers time out while a healthy leader is still between heartbeats.
    #[error("the heartbeat interval must be strictly less than election timeout min")]
    HeartbeatIntervalTooLarge,
    /// The given value for max_payload_entries is too small, must be > 0.
    #[error("the given value for max_payload_entries is too small, must be > 0")]
    MaxPayloadEntriesTooSmall,
    /// The given value for snapshot_max_chunk_size is too small, must be > 0.
    #[error("the given value for snapshot_max_chunk_size is too small, must be > 0")]
    SnapshotChunkSizeTooSmall,
    /// The given value for replication_queue_capacity is too small, must be > 0.
    #[error("the given value for replication_queue_capacity is too small, must be > 0")]
    ReplicationQueueCapacityTooSmall,
}

/// The set of errors which may take place when initializing a pristine Raft node.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InitializeError {
    /// An internal error has taken place.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The requested action is not allowed due to the Raft node's current state.
    #[error("the requested action is not allowed due to the Raft node's current state")]
    NotAllowed,
}
