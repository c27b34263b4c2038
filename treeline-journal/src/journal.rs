//! The segment-based journal.

use std::fs;
use std::fs::File;
use std::marker::PhantomData;
use std::path::PathBuf;

use thiserror::Error;
use treeline_raft::raft::Entry;
use treeline_raft::{AppData, LogId};

use crate::codec;
use crate::codec::CodecError;
use crate::segment;
use crate::segment::SegmentMeta;
use crate::sparse_index::SparseIndex;

/// Default maximum byte length of a segment before it is sealed and a new one started.
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 16 * 1024 * 1024;
/// Default sparse index density.
pub const DEFAULT_INDEX_DENSITY: f64 = 0.1;

/// Configuration of a [`SegmentedJournal`].
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// The directory holding the segment files. Exclusively owned by one journal instance.
    pub dir: PathBuf,
    /// Maximum byte length of a segment before rolling to a new one.
    pub max_segment_bytes: u64,
    /// Fraction (0, 1] of index→offset mappings the sparse index retains.
    pub index_density: f64,
}

impl JournalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            index_density: DEFAULT_INDEX_DENSITY,
        }
    }

    fn validate(&self) -> Result<(), JournalError> {
        if self.max_segment_bytes == 0 {
            return Err(JournalError::InvalidConfig("max_segment_bytes must be > 0".into()));
        }
        if !(self.index_density > 0.0 && self.index_density <= 1.0) {
            return Err(JournalError::InvalidConfig(format!(
                "index_density must be in (0, 1], got {}",
                self.index_density
            )));
        }
        Ok(())
    }
}

/// An error arising from the journal.
#[derive(Debug, Error)]
pub enum JournalError {
    /// An I/O error from the underlying file system.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The on-disk state is damaged: a failed checksum, an index discontinuity, or a torn
    /// frame anywhere but the tail of the newest segment. Not recoverable by the replica.
    #[error("journal corrupt: {0}")]
    Corrupt(String),
    /// An append did not continue the log contiguously.
    #[error("non-contiguous append: expected index {expected}, got {got}")]
    NonContiguous { expected: u64, got: u64 },
    /// The requested entries have been compacted into a snapshot and are no longer retained.
    #[error("entries at or below index {0} have been compacted into a snapshot")]
    Compacted(u64),
    /// The journal configuration is invalid.
    #[error("invalid journal config: {0}")]
    InvalidConfig(String),
}

impl From<CodecError> for JournalError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(io) => JournalError::Io(io),
            other => JournalError::Corrupt(other.to_string()),
        }
    }
}

/// An append-only, segmented journal of log entries addressed by absolute index.
///
/// Entries are stored contiguously, with no gaps. The newest segment is the active one and
/// receives appends; once it outgrows `max_segment_bytes` it is sealed and a new segment is
/// started. A sparse index provides index→offset hints for reads; reads scan forward from the
/// hinted offset.
#[derive(Debug)]
pub struct SegmentedJournal<D: AppData> {
    cfg: JournalConfig,
    /// All segments in index order. The last one is the active segment.
    segments: Vec<SegmentMeta>,
    /// Append handle for the active segment.
    active: File,
    index: SparseIndex,
    _marker: PhantomData<D>,
}

impl<D: AppData> SegmentedJournal<D> {
    /// Open the journal in the configured directory, recovering all segments.
    ///
    /// Recovery tolerates exactly one kind of damage: a torn frame at the tail of the newest
    /// segment, which is dropped. Any other damage (checksum failure, torn frame in a sealed
    /// segment, index discontinuity) is corruption and fails the open.
    pub fn open(cfg: JournalConfig) -> Result<Self, JournalError> {
        cfg.validate()?;
        fs::create_dir_all(&cfg.dir)?;

        let listed = segment::list_segments(&cfg.dir)?;
        let mut index = SparseIndex::new(cfg.index_density);
        let mut segments: Vec<SegmentMeta> = Vec::new();
        let count = listed.len();
        let mut expected: Option<u64> = None;
        for (i, (first_index, path)) in listed.into_iter().enumerate() {
            let is_last = i + 1 == count;
            let meta = Self::recover_segment(&mut index, first_index, path, expected, is_last)?;
            if meta.entry_count > 0 {
                expected = Some(meta.last_index + 1);
            }
            segments.push(meta);
        }

        if segments.is_empty() {
            let (meta, file) = segment::create_segment(&cfg.dir, 1)?;
            segments.push(meta);
            return Ok(Self {
                cfg,
                segments,
                active: file,
                index,
                _marker: PhantomData,
            });
        }

        let active_path = segments[segments.len() - 1].path.clone();
        let active = segment::open_segment_for_append(&active_path)?;
        Ok(Self {
            cfg,
            segments,
            active,
            index,
            _marker: PhantomData,
        })
    }

    fn recover_segment(
        index: &mut SparseIndex,
        first_index: u64,
        path: PathBuf,
        expected: Option<u64>,
        is_last: bool,
    ) -> Result<SegmentMeta, JournalError> {
        let bytes = fs::read(&path)?;
        let mut meta = SegmentMeta {
            first_index,
            last_index: 0,
            last_term: 0,
            path,
            len: 0,
            entry_count: 0,
        };
        let mut expected = expected;
        let mut offset = 0usize;
        while offset < bytes.len() {
            match codec::decode_entry::<D>(&bytes[offset..]) {
                Ok((entry, used)) => {
                    let got = entry.log_id.index;
                    if meta.entry_count == 0 && got != first_index {
                        return Err(JournalError::Corrupt(format!(
                            "segment {:?} named for index {} but starts at index {}",
                            meta.path, first_index, got
                        )));
                    }
                    let want = expected.unwrap_or(first_index);
                    if got != want {
                        return Err(JournalError::Corrupt(format!(
                            "index discontinuity in segment {:?}: expected {}, found {}",
                            meta.path, want, got
                        )));
                    }
                    index.index(got, offset as u64);
                    meta.last_index = got;
                    meta.last_term = entry.log_id.term;
                    meta.entry_count += 1;
                    expected = Some(got + 1);
                    offset += used;
                }
                Err(CodecError::Truncated { .. }) => {
                    if !is_last {
                        return Err(JournalError::Corrupt(format!(
                            "torn frame inside sealed segment {:?} at offset {}",
                            meta.path, offset
                        )));
                    }
                    // A torn tail on the newest segment is the expected shape of a crash
                    // mid-append; drop the partial frame.
                    tracing::warn!(path = ?meta.path, offset, "dropping torn frame at tail of newest segment");
                    let file = fs::OpenOptions::new().write(true).open(&meta.path)?;
                    file.set_len(offset as u64)?;
                    file.sync_all()?;
                    break;
                }
                Err(err) => {
                    return Err(JournalError::Corrupt(format!("segment {:?} at offset {}: {}", meta.path, offset, err)));
                }
            }
        }
        meta.len = offset as u64;
        Ok(meta)
    }

    /// The smallest index still retained in the journal.
    pub fn first_index(&self) -> u64 {
        self.segments[0].first_index
    }

    /// The id of the newest entry, if the journal holds any.
    pub fn last_log_id(&self) -> Option<LogId> {
        self.segments
            .iter()
            .rev()
            .find(|seg| seg.entry_count > 0)
            .map(|seg| LogId::new(seg.last_term, seg.last_index))
    }

    /// The index the next appended entry must carry.
    pub fn next_index(&self) -> u64 {
        match self.last_log_id() {
            Some(id) => id.index + 1,
            None => self.segments[self.segments.len() - 1].first_index,
        }
    }

    /// Number of retained entries.
    pub fn entry_count(&self) -> u64 {
        self.segments.iter().map(|seg| seg.entry_count).sum()
    }

    fn active_meta(&mut self) -> &mut SegmentMeta {
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    /// Append entries to the journal, rolling the active segment as needed. The batch is
    /// durable (fsynced) when this returns.
    pub fn append(&mut self, entries: &[Entry<D>]) -> Result<(), JournalError> {
        use std::io::Write;

        if entries.is_empty() {
            return Ok(());
        }
        for entry in entries {
            let expected = self.next_index();
            if entry.log_id.index != expected {
                return Err(JournalError::NonContiguous {
                    expected,
                    got: entry.log_id.index,
                });
            }

            let mut frame = Vec::new();
            codec::encode_entry(entry, &mut frame)?;

            let needs_roll = {
                let active = self.active_meta();
                active.len > 0 && active.len + frame.len() as u64 > self.cfg.max_segment_bytes
            };
            if needs_roll {
                self.active.sync_all()?;
                let (meta, file) = segment::create_segment(&self.cfg.dir, entry.log_id.index)?;
                self.segments.push(meta);
                self.active = file;
            }

            let offset = self.active_meta().len;
            self.active.write_all(&frame)?;
            self.index.index(entry.log_id.index, offset);

            let active = self.active_meta();
            active.len += frame.len() as u64;
            active.last_index = entry.log_id.index;
            active.last_term = entry.log_id.term;
            active.entry_count += 1;
        }
        self.active.sync_data()?;
        Ok(())
    }

    /// Read the retained entries in `[from, to)`.
    ///
    /// Requests reaching below the first retained index fail with `Compacted`; requests
    /// reaching beyond the newest entry are clamped.
    pub fn read_range(&self, from: u64, to: u64) -> Result<Vec<Entry<D>>, JournalError> {
        if from >= to {
            return Ok(Vec::new());
        }
        if from < self.first_index() {
            return Err(JournalError::Compacted(self.first_index().saturating_sub(1)));
        }
        let last = match self.last_log_id() {
            Some(id) => id.index,
            None => return Ok(Vec::new()),
        };
        let to = std::cmp::min(to, last + 1);
        if from >= to {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for seg in &self.segments {
            if seg.entry_count == 0 || seg.last_index < from {
                continue;
            }
            if seg.first_index >= to {
                break;
            }
            self.scan_segment(seg, from, to, &mut out)?;
        }
        Ok(out)
    }

    /// Fetch a single retained entry, if present.
    pub fn try_get(&self, index: u64) -> Result<Option<Entry<D>>, JournalError> {
        if index < self.first_index() {
            return Ok(None);
        }
        match self.last_log_id() {
            Some(id) if index <= id.index => {}
            _ => return Ok(None),
        }
        Ok(self.read_range(index, index + 1)?.into_iter().next())
    }

    /// Scan one segment for entries in `[from, to)`, starting from the sparse index hint when
    /// one lands inside this segment.
    fn scan_segment(&self, seg: &SegmentMeta, from: u64, to: u64, out: &mut Vec<Entry<D>>) -> Result<(), JournalError> {
        let bytes = fs::read(&seg.path)?;
        let mut offset = 0usize;
        if let Some(hint) = self.index.lookup(from) {
            if hint.index >= seg.first_index && hint.index <= seg.last_index {
                offset = hint.offset as usize;
            }
        }
        while offset < bytes.len() {
            let (entry, used) = codec::decode_entry::<D>(&bytes[offset..])
                .map_err(|err| JournalError::Corrupt(format!("segment {:?} at offset {}: {}", seg.path, offset, err)))?;
            let index = entry.log_id.index;
            if index >= to {
                break;
            }
            if index >= from {
                out.push(entry);
            }
            offset += used;
        }
        Ok(())
    }

    /// Remove the entry at `from` and everything after it.
    ///
    /// Whole segments past the cut are deleted; the segment holding the cut is rewritten in
    /// place (write-temp-then-rename). The caller is responsible for never truncating into
    /// committed territory.
    pub fn truncate_from(&mut self, from: u64) -> Result<(), JournalError> {
        let last = match self.last_log_id() {
            Some(id) => id.index,
            None => return Ok(()),
        };
        if from > last {
            return Ok(());
        }
        if from < self.first_index() {
            return Err(JournalError::Compacted(self.first_index().saturating_sub(1)));
        }

        let seg_idx = match self.segments.iter().rposition(|seg| seg.entry_count > 0 && seg.first_index <= from) {
            Some(idx) => idx,
            None => return Ok(()),
        };

        let mut survivors = Vec::new();
        self.scan_segment(&self.segments[seg_idx], self.segments[seg_idx].first_index, from, &mut survivors)?;

        // Every segment past the cut goes entirely.
        for seg in self.segments.drain(seg_idx + 1..) {
            fs::remove_file(&seg.path)?;
        }

        let seg_path = self.segments[seg_idx].path.clone();
        if survivors.is_empty() {
            // The cut segment goes entirely as well; continue appending to the one before it,
            // or start fresh if none remains.
            fs::remove_file(&seg_path)?;
            self.segments.pop();
            match self.segments.last() {
                Some(prev) => {
                    self.active = segment::open_segment_for_append(&prev.path)?;
                }
                None => {
                    let (meta, file) = segment::create_segment(&self.cfg.dir, from)?;
                    self.segments.push(meta);
                    self.active = file;
                }
            }
        } else {
            let mut content = Vec::new();
            for entry in &survivors {
                codec::encode_entry(entry, &mut content)?;
            }
            segment::rewrite_segment(&seg_path, &content)?;
            let last_entry = &survivors[survivors.len() - 1];
            let seg = &mut self.segments[seg_idx];
            seg.len = content.len() as u64;
            seg.last_index = last_entry.log_id.index;
            seg.last_term = last_entry.log_id.term;
            seg.entry_count = survivors.len() as u64;
            self.active = segment::open_segment_for_append(&seg_path)?;
        }

        self.index.truncate(from);
        Ok(())
    }

    /// Discard whole segments whose entries are all at or below `through` (typically a
    /// snapshot boundary).
    ///
    /// Segments are never split: entries above the last removed segment remain, even if some
    /// of them are at or below `through`. The newest segment always stays.
    pub fn compact_through(&mut self, through: u64) -> Result<(), JournalError> {
        while self.segments.len() > 1 {
            let seg = &self.segments[0];
            if seg.entry_count > 0 && seg.last_index <= through {
                fs::remove_file(&seg.path)?;
                self.segments.remove(0);
            } else {
                break;
            }
        }
        self.index.compact(self.segments[0].first_index);
        Ok(())
    }

    /// Discard everything and start an empty journal whose next entry will be `next_index`.
    ///
    /// Used when installing a snapshot that supersedes the entire local log.
    pub fn reset(&mut self, next_index: u64) -> Result<(), JournalError> {
        for seg in self.segments.drain(..) {
            fs::remove_file(&seg.path)?;
        }
        self.index.clear();
        let (meta, file) = segment::create_segment(&self.cfg.dir, next_index)?;
        self.segments.push(meta);
        self.active = file;
        Ok(())
    }
}
