//! The durable journal of the Treeline data-store controller.
//!
//! The journal is a sequence of append-only segment files holding CRC-framed, length-prefixed
//! log entries, addressed by absolute log index. A [`SparseIndex`] keeps a configurable
//! fraction of index→offset mappings resident so lookups seek close to an entry and scan
//! forward, instead of either keeping a full index in memory or scanning whole segments.
//!
//! [`JournalStore`] composes the journal with a snapshot file store and a hard-state sidecar
//! into a complete implementation of `treeline_raft::RaftStorage`.

pub mod codec;
mod journal;
mod segment;
mod snapshot;
pub mod sparse_index;
mod store;

pub use crate::codec::CodecError;
pub use crate::journal::JournalConfig;
pub use crate::journal::JournalError;
pub use crate::journal::SegmentedJournal;
pub use crate::snapshot::SnapshotFileStore;
pub use crate::sparse_index::Position;
pub use crate::sparse_index::SparseIndex;
pub use crate::store::BlobData;
pub use crate::store::BlobResponse;
pub use crate::store::JournalStore;
pub use crate::store::JournalStoreOptions;
pub use crate::store::StateMachine;
