//! The snapshot file store.
//!
//! Snapshots are written to a temporary file first and renamed into place only once their
//! bytes are durable. A crash between writing and publishing leaves an orphaned `.tmp` file,
//! which recovery ignores and removes; a crash after publishing leaves a complete snapshot.
//! Combined with the rule that the journal is only trimmed after publication, recovery always
//! sees either (no snapshot, log intact) or (snapshot, log trimmed), never a trimmed log
//! without its snapshot.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use treeline_raft::storage::SnapshotMeta;
use treeline_raft::{LogId, SnapshotId};

/// A file-system store holding at most one published snapshot.
pub struct SnapshotFileStore {
    dir: PathBuf,
    /// Distinguishes snapshot ids created within one process lifetime.
    counter: AtomicU64,
}

fn snapshot_filename(last_log_id: &LogId, snapshot_id: &str) -> String {
    format!("snapshot-{:020}-{:020}-{}.snap", last_log_id.term, last_log_id.index, snapshot_id)
}

fn parse_snapshot_filename(filename: &str) -> Option<(LogId, SnapshotId)> {
    let rest = filename.strip_prefix("snapshot-")?.strip_suffix(".snap")?;
    let mut parts = rest.splitn(3, '-');
    let term: u64 = parts.next()?.parse().ok()?;
    let index: u64 = parts.next()?.parse().ok()?;
    let id = parts.next()?;
    Some((LogId::new(term, index), id.to_string()))
}

impl SnapshotFileStore {
    /// Open the store, creating its directory and removing any orphaned temporary files left
    /// by a crash mid-capture or mid-install.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        for dirent in fs::read_dir(&dir)? {
            let path = dirent?.path();
            if path.extension().map(|ext| ext == "tmp").unwrap_or(false) {
                tracing::warn!(path = ?path, "removing orphaned snapshot temp file");
                fs::remove_file(&path)?;
            }
        }
        Ok(Self {
            dir,
            counter: AtomicU64::new(1),
        })
    }

    /// Generate a fresh snapshot id.
    pub fn new_snapshot_id(&self, last_log_id: &LogId) -> SnapshotId {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", last_log_id.term, last_log_id.index, seq)
    }

    /// The path a snapshot with the given id is staged at while being written.
    pub fn temp_path(&self, snapshot_id: &str) -> PathBuf {
        self.dir.join(format!("{}.tmp", snapshot_id))
    }

    /// The path of a published snapshot.
    pub fn published_path(&self, meta: &SnapshotMeta) -> PathBuf {
        self.dir.join(snapshot_filename(&meta.last_log_id, &meta.snapshot_id))
    }

    /// Durably publish the staged temp file for `snapshot_id` as the current snapshot, and
    /// delete any previously published snapshots.
    ///
    /// The rename is the commit point: only after this returns may the journal be trimmed.
    pub fn publish(&self, snapshot_id: &str, last_log_id: &LogId) -> io::Result<PathBuf> {
        let tmp = self.temp_path(snapshot_id);
        {
            let file = fs::OpenOptions::new().read(true).open(&tmp)?;
            file.sync_all()?;
        }
        let published = self.dir.join(snapshot_filename(last_log_id, snapshot_id));
        fs::rename(&tmp, &published)?;

        // Older snapshots are superseded; remove them.
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if path == published {
                continue;
            }
            if path.extension().map(|ext| ext == "snap").unwrap_or(false) {
                fs::remove_file(&path)?;
            }
        }
        Ok(published)
    }

    /// Load the metadata and path of the newest published snapshot, if one exists.
    ///
    /// Unpublished `.tmp` files are never returned.
    pub fn load_current(&self) -> io::Result<Option<(SnapshotMeta, PathBuf)>> {
        let mut newest: Option<(LogId, SnapshotId, PathBuf)> = None;
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            let filename = match path.file_name().and_then(|name| name.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if let Some((log_id, id)) = parse_snapshot_filename(filename) {
                if newest.as_ref().map(|(cur, _, _)| log_id > *cur).unwrap_or(true) {
                    newest = Some((log_id, id, path));
                }
            }
        }
        match newest {
            Some((last_log_id, snapshot_id, path)) => {
                let total_len = fs::metadata(&path)?.len();
                Ok(Some((
                    SnapshotMeta {
                        last_log_id,
                        snapshot_id,
                        total_len,
                        chunk_size: 0,
                    },
                    path,
                )))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn filename_roundtrip() {
        let log_id = LogId::new(3, 500);
        let name = snapshot_filename(&log_id, "3-500-1");
        let (parsed_id, parsed_snap) = parse_snapshot_filename(&name).unwrap();
        assert_eq!(parsed_id, log_id);
        assert_eq!(parsed_snap, "3-500-1");
    }

    #[test]
    fn publish_is_atomic_and_supersedes() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SnapshotFileStore::open(dir.path())?;

        // Nothing published yet; a staged temp file is not a snapshot.
        let id1 = store.new_snapshot_id(&LogId::new(1, 10));
        fs::File::create(store.temp_path(&id1))?.write_all(b"snap one")?;
        assert!(store.load_current()?.is_none());

        store.publish(&id1, &LogId::new(1, 10))?;
        let (meta, path) = store.load_current()?.unwrap();
        assert_eq!(meta.last_log_id, LogId::new(1, 10));
        assert_eq!(meta.total_len, 8);
        assert_eq!(fs::read(path)?, b"snap one");

        // A newer snapshot supersedes and removes the old one.
        let id2 = store.new_snapshot_id(&LogId::new(2, 30));
        fs::File::create(store.temp_path(&id2))?.write_all(b"snap two!")?;
        store.publish(&id2, &LogId::new(2, 30))?;
        let (meta, _) = store.load_current()?.unwrap();
        assert_eq!(meta.last_log_id, LogId::new(2, 30));
        assert_eq!(meta.total_len, 9);
        let published: Vec<_> = fs::read_dir(dir.path())?
            .filter_map(|d| d.ok())
            .filter(|d| d.path().extension().map(|e| e == "snap").unwrap_or(false))
            .collect();
        assert_eq!(published.len(), 1);
        Ok(())
    }

    #[test]
    fn orphaned_temp_files_are_removed_on_open() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = SnapshotFileStore::open(dir.path())?;
            fs::File::create(store.temp_path("crashed"))?.write_all(b"partial")?;
        }
        let store = SnapshotFileStore::open(dir.path())?;
        assert!(store.load_current()?.is_none());
        assert!(!store.temp_path("crashed").exists());
        Ok(())
    }
}
