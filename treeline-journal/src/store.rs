//! A complete `RaftStorage` implementation over the segmented journal.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use treeline_raft::raft::Entry;
use treeline_raft::storage::{HardState, InitialState, RaftStorage, Snapshot, SnapshotMeta};
use treeline_raft::{AppData, AppDataResponse, LogId, NodeId, SnapshotId};

use crate::journal::{JournalConfig, JournalError, SegmentedJournal};
use crate::snapshot::SnapshotFileStore;

/// The application data type which the `JournalStore` works with: an opaque byte payload
/// with a size. The schema and semantics of the bytes are the business of the layer above.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlobData {
    pub data: Vec<u8>,
}

impl BlobData {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

impl AppData for BlobData {}

/// The response produced when a `BlobData` payload is applied.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlobResponse {
    /// The log index the payload was applied at.
    pub index: u64,
}

impl AppDataResponse for BlobResponse {}

/// The store's state machine: applied payloads retained by index.
///
/// Embedding applications replace this with their own apply layer; this one exists so the
/// consensus crate can be driven end-to-end, and doubles as the snapshot body (it serializes
/// to the snapshot file as-is).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StateMachine {
    /// The index of the last applied entry.
    pub last_applied: u64,
    /// The applied payloads.
    pub entries: BTreeMap<u64, Vec<u8>>,
}

/// Options for opening a [`JournalStore`].
#[derive(Debug, Clone)]
pub struct JournalStoreOptions {
    /// Maximum byte length of a journal segment.
    pub max_segment_bytes: u64,
    /// Sparse index density for the journal.
    pub index_density: f64,
}

impl Default for JournalStoreOptions {
    fn default() -> Self {
        Self {
            max_segment_bytes: crate::journal::DEFAULT_MAX_SEGMENT_BYTES,
            index_density: crate::journal::DEFAULT_INDEX_DENSITY,
        }
    }
}

/// A durable Raft storage backend: segmented journal + snapshot file store + hard-state
/// sidecar.
///
/// Layout within the store directory:
///
/// ```text
/// <dir>/journal/seg_*.jrnl     the segmented log
/// <dir>/snapshots/*.snap       at most one published snapshot (+ in-flight *.tmp files)
/// <dir>/hard_state.json        term / vote / membership
/// ```
pub struct JournalStore {
    id: NodeId,
    journal: RwLock<SegmentedJournal<BlobData>>,
    sm: RwLock<StateMachine>,
    hs: RwLock<Option<HardState>>,
    hs_path: PathBuf,
    snapshots: SnapshotFileStore,
    current_snapshot: RwLock<Option<SnapshotMeta>>,
    /// The staged temp file of a snapshot currently being installed from the leader.
    pending_install: RwLock<Option<PathBuf>>,
}

impl JournalStore {
    /// Open (or create) a store rooted at `dir` with default journal options.
    pub fn open(id: NodeId, dir: impl Into<PathBuf>) -> Result<Self, JournalError> {
        Self::open_with_options(id, dir, JournalStoreOptions::default())
    }

    /// Open (or create) a store rooted at `dir`.
    pub fn open_with_options(id: NodeId, dir: impl Into<PathBuf>, options: JournalStoreOptions) -> Result<Self, JournalError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let journal_cfg = JournalConfig {
            dir: dir.join("journal"),
            max_segment_bytes: options.max_segment_bytes,
            index_density: options.index_density,
        };
        let journal = SegmentedJournal::open(journal_cfg)?;
        let snapshots = SnapshotFileStore::open(dir.join("snapshots"))?;

        let hs_path = dir.join("hard_state.json");
        let hs = if hs_path.exists() {
            let bytes = std::fs::read(&hs_path)?;
            Some(serde_json::from_slice(&bytes).map_err(|err| JournalError::Corrupt(format!("hard state file: {}", err)))?)
        } else {
            None
        };

        // Recover the state machine from the current snapshot, if any. Entries applied after
        // the snapshot are re-applied by the consensus layer once the commit index is
        // re-established.
        let mut sm = StateMachine::default();
        let current = snapshots.load_current()?;
        if let Some((meta, path)) = &current {
            let bytes = std::fs::read(path)?;
            sm = serde_json::from_slice(&bytes).map_err(|err| JournalError::Corrupt(format!("snapshot body: {}", err)))?;
            sm.last_applied = meta.last_log_id.index;
        }

        Ok(Self {
            id,
            journal: RwLock::new(journal),
            sm: RwLock::new(sm),
            hs: RwLock::new(hs),
            hs_path,
            snapshots,
            current_snapshot: RwLock::new(current.map(|(meta, _)| meta)),
            pending_install: RwLock::new(None),
        })
    }

    /// A copy of the current state machine, for inspection.
    pub async fn state_machine(&self) -> StateMachine {
        self.sm.read().await.clone()
    }

    /// The smallest log index still retained in the journal.
    pub async fn journal_first_index(&self) -> u64 {
        self.journal.read().await.first_index()
    }

    /// Number of entries retained in the journal.
    pub async fn journal_entry_count(&self) -> u64 {
        self.journal.read().await.entry_count()
    }
}

#[async_trait]
impl RaftStorage<BlobData, BlobResponse> for JournalStore {
    type SnapshotData = tokio::fs::File;

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_initial_state(&self) -> Result<InitialState> {
        let mut hs = self.hs.write().await;
        match &mut *hs {
            Some(inner) => {
                let journal = self.journal.read().await;
                let snapshot = self.current_snapshot.read().await;
                let last_log_id = journal
                    .last_log_id()
                    .or_else(|| snapshot.as_ref().map(|meta| meta.last_log_id))
                    .unwrap_or_default();
                let sm = self.sm.read().await;
                Ok(InitialState {
                    last_log_id,
                    last_applied_log: sm.last_applied,
                    hard_state: inner.clone(),
                })
            }
            None => {
                let new = InitialState::new_initial(self.id);
                *hs = Some(new.hard_state.clone());
                Ok(new)
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, hs))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(hs)?;
        let tmp = self.hs_path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.hs_path)?;
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry<BlobData>>> {
        Ok(self.journal.read().await.read_range(start, stop)?)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn try_get_log_entry(&self, index: u64) -> Result<Option<Entry<BlobData>>> {
        Ok(self.journal.read().await.try_get(index)?)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete_logs_from(&self, start: u64) -> Result<()> {
        Ok(self.journal.write().await.truncate_from(start)?)
    }

    #[tracing::instrument(level = "trace", skip(self, entry))]
    async fn append_entry_to_log(&self, entry: &Entry<BlobData>) -> Result<()> {
        Ok(self.journal.write().await.append(std::slice::from_ref(entry))?)
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn replicate_to_log(&self, entries: &[Entry<BlobData>]) -> Result<()> {
        Ok(self.journal.write().await.append(entries)?)
    }

    #[tracing::instrument(level = "trace", skip(self, data))]
    async fn apply_entry_to_state_machine(&self, log_id: &LogId, data: &BlobData) -> Result<BlobResponse> {
        let mut sm = self.sm.write().await;
        sm.entries.insert(log_id.index, data.data.clone());
        sm.last_applied = log_id.index;
        Ok(BlobResponse { index: log_id.index })
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn replicate_to_state_machine(&self, entries: &[(&LogId, &BlobData)]) -> Result<()> {
        let mut sm = self.sm.write().await;
        for (log_id, data) in entries {
            sm.entries.insert(log_id.index, data.data.clone());
            sm.last_applied = log_id.index;
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn do_log_compaction(&self, through: u64) -> Result<Snapshot<Self::SnapshotData>> {
        // Serialize the state machine as of `through`.
        let (last_log_id, body) = {
            let journal = self.journal.read().await;
            let sm = self.sm.read().await;
            let term = match journal.try_get(through)? {
                Some(entry) => entry.log_id.term,
                None => {
                    // `through` may coincide with the previous snapshot's boundary.
                    let current = self.current_snapshot.read().await;
                    match &*current {
                        Some(meta) if meta.last_log_id.index == through => meta.last_log_id.term,
                        _ => return Err(anyhow::anyhow!("no entry at compaction index {}", through)),
                    }
                }
            };
            let snapshot_sm = StateMachine {
                last_applied: through,
                entries: sm.entries.range(..=through).map(|(index, data)| (*index, data.clone())).collect(),
            };
            (LogId::new(term, through), serde_json::to_vec(&snapshot_sm)?)
        };

        // Stage, sync, publish. The publish rename is the commit point: the journal is only
        // trimmed after it, so a crash in between leaves the log intact.
        let snapshot_id = self.snapshots.new_snapshot_id(&last_log_id);
        let tmp = self.snapshots.temp_path(&snapshot_id);
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        let published = self.snapshots.publish(&snapshot_id, &last_log_id)?;

        self.journal.write().await.compact_through(through)?;

        let meta = SnapshotMeta {
            last_log_id,
            snapshot_id,
            total_len: body.len() as u64,
            chunk_size: 0,
        };
        *self.current_snapshot.write().await = Some(meta.clone());

        let file = tokio::fs::File::open(&published).await?;
        Ok(Snapshot {
            meta,
            snapshot: Box::new(file),
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn create_snapshot(&self) -> Result<(SnapshotId, Box<Self::SnapshotData>)> {
        let snapshot_id = self.snapshots.new_snapshot_id(&LogId::default());
        let tmp = self.snapshots.temp_path(&snapshot_id);
        let file = tokio::fs::File::create(&tmp).await?;
        *self.pending_install.write().await = Some(tmp);
        Ok((snapshot_id, Box::new(file)))
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
        delete_through: Option<u64>,
    ) -> Result<()> {
        // The writer has already been shut down by the caller.
        drop(snapshot);

        let staged = self.pending_install.write().await.take();
        let staged = staged.ok_or_else(|| anyhow::anyhow!("no snapshot installation in progress"))?;

        // Publish the streamed bytes under the leader's snapshot id.
        let stage_for_meta = self.snapshots.temp_path(&meta.snapshot_id);
        if stage_for_meta != staged {
            std::fs::rename(&staged, &stage_for_meta)?;
        }
        self.snapshots.publish(&meta.snapshot_id, &meta.last_log_id)?;

        // Restore the state machine from the installed snapshot.
        let published = self.snapshots.published_path(meta);
        let bytes = std::fs::read(&published)?;
        let mut restored: StateMachine =
            serde_json::from_slice(&bytes).map_err(|err| JournalError::Corrupt(format!("installed snapshot body: {}", err)))?;
        restored.last_applied = meta.last_log_id.index;

        {
            let mut journal = self.journal.write().await;
            match delete_through {
                // A retained log suffix continues past the snapshot; trim only the prefix.
                Some(through) => journal.compact_through(through)?,
                // The snapshot supersedes the entire log.
                None => journal.reset(meta.last_log_id.index + 1)?,
            }
        }
        *self.sm.write().await = restored;
        *self.current_snapshot.write().await = Some(SnapshotMeta {
            total_len: bytes.len() as u64,
            chunk_size: 0,
            ..meta.clone()
        });
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        let current = self.current_snapshot.read().await.clone();
        match current {
            Some(meta) => {
                let path = self.snapshots.published_path(&meta);
                let file = tokio::fs::File::open(&path).await?;
                Ok(Some(Snapshot {
                    meta,
                    snapshot: Box::new(file),
                }))
            }
            None => Ok(None),
        }
    }
}
