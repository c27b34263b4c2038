//! On-disk behavior of the segmented journal: recovery, rolling, truncation, compaction.

use std::fs;

use treeline_journal::{BlobData, JournalConfig, JournalError, SegmentedJournal};
use treeline_raft::raft::{Entry, EntryNormal, EntryPayload};
use treeline_raft::LogId;

fn entry(term: u64, index: u64) -> Entry<BlobData> {
    Entry {
        log_id: LogId::new(term, index),
        payload: EntryPayload::Normal(EntryNormal {
            data: BlobData::new(format!("payload-{:04}", index).into_bytes()),
        }),
    }
}

fn entries(term: u64, range: std::ops::RangeInclusive<u64>) -> Vec<Entry<BlobData>> {
    range.map(|index| entry(term, index)).collect()
}

fn small_segment_config(dir: &std::path::Path) -> JournalConfig {
    JournalConfig {
        dir: dir.to_path_buf(),
        // A few entries per segment, so tests exercise rolling and whole-segment compaction.
        max_segment_bytes: 256,
        index_density: 0.2,
    }
}

#[test]
fn append_read_and_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let mut journal = SegmentedJournal::open(JournalConfig::new(dir.path()))?;
        assert_eq!(journal.last_log_id(), None);
        journal.append(&entries(1, 1..=20))?;
        assert_eq!(journal.last_log_id(), Some(LogId::new(1, 20)));

        let read = journal.read_range(5, 9)?;
        assert_eq!(read.iter().map(|e| e.log_id.index).collect::<Vec<_>>(), vec![5, 6, 7, 8]);
        // Reads past the end are clamped.
        assert_eq!(journal.read_range(18, 100)?.len(), 3);
        assert_eq!(journal.try_get(7)?.unwrap().log_id, LogId::new(1, 7));
        assert_eq!(journal.try_get(21)?, None);
    }

    // Everything survives a reopen.
    let journal = SegmentedJournal::<BlobData>::open(JournalConfig::new(dir.path()))?;
    assert_eq!(journal.last_log_id(), Some(LogId::new(1, 20)));
    assert_eq!(journal.entry_count(), 20);
    assert_eq!(journal.read_range(1, 21)?.len(), 20);
    Ok(())
}

#[test]
fn appends_must_be_contiguous() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut journal = SegmentedJournal::open(small_segment_config(dir.path()))?;
    journal.append(&entries(1, 1..=3))?;

    let err = journal.append(&[entry(1, 5)]).unwrap_err();
    assert!(
        matches!(err, JournalError::NonContiguous { expected: 4, got: 5 }),
        "unexpected error: {:?}",
        err
    );
    Ok(())
}

#[test]
fn segments_roll_and_reads_span_them() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut journal = SegmentedJournal::open(small_segment_config(dir.path()))?;
    journal.append(&entries(1, 1..=12))?;

    let segment_files: Vec<_> = fs::read_dir(dir.path())?
        .filter_map(|dirent| dirent.ok())
        .filter(|dirent| dirent.path().extension().map(|ext| ext == "jrnl").unwrap_or(false))
        .collect();
    assert!(segment_files.len() > 1, "expected the journal to roll segments, found {}", segment_files.len());

    let read = journal.read_range(1, 13)?;
    assert_eq!(read.len(), 12);
    assert!(read.windows(2).all(|w| w[1].log_id.index == w[0].log_id.index + 1));
    Ok(())
}

#[test]
fn torn_tail_is_dropped_on_recovery() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let mut journal = SegmentedJournal::open(JournalConfig::new(dir.path()))?;
        journal.append(&entries(1, 1..=5))?;
    }

    // Simulate a crash mid-append: a partial frame at the tail of the newest segment.
    let newest = newest_segment_path(dir.path())?;
    let mut bytes = fs::read(&newest)?;
    bytes.extend_from_slice(&[0x40, 0x00, 0x00, 0x00, 0xde, 0xad]); // claims 64 bytes, has none
    fs::write(&newest, &bytes)?;

    let mut journal = SegmentedJournal::<BlobData>::open(JournalConfig::new(dir.path()))?;
    assert_eq!(journal.last_log_id(), Some(LogId::new(1, 5)), "the torn frame is dropped, entries intact");

    // The journal continues to accept appends at the next index.
    journal.append(&[entry(1, 6)])?;
    assert_eq!(journal.last_log_id(), Some(LogId::new(1, 6)));
    Ok(())
}

#[test]
fn corrupted_frame_fails_recovery() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let mut journal = SegmentedJournal::open(JournalConfig::new(dir.path()))?;
        journal.append(&entries(1, 1..=5))?;
    }

    // Flip a payload byte of the final frame: a CRC failure, which is corruption even at the
    // tail; only a short (torn) frame is recoverable there.
    let newest = newest_segment_path(dir.path())?;
    let mut bytes = fs::read(&newest)?;
    let target = bytes.len() - 2;
    bytes[target] ^= 0xFF;
    fs::write(&newest, &bytes)?;

    let err = SegmentedJournal::<BlobData>::open(JournalConfig::new(dir.path())).unwrap_err();
    assert!(matches!(err, JournalError::Corrupt(_)), "unexpected error: {:?}", err);
    Ok(())
}

#[test]
fn truncate_from_rewrites_the_cut_segment() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut journal = SegmentedJournal::open(small_segment_config(dir.path()))?;
    journal.append(&entries(1, 1..=12))?;

    journal.truncate_from(8)?;
    assert_eq!(journal.last_log_id(), Some(LogId::new(1, 7)));
    assert_eq!(journal.read_range(1, 100)?.len(), 7);
    assert_eq!(journal.try_get(8)?, None);

    // Appends continue from the cut, in a different term.
    journal.append(&entries(2, 8..=10))?;
    assert_eq!(journal.last_log_id(), Some(LogId::new(2, 10)));
    assert_eq!(journal.try_get(8)?.unwrap().log_id, LogId::new(2, 8));

    // The rewrite is durable across a reopen.
    drop(journal);
    let journal = SegmentedJournal::<BlobData>::open(small_segment_config(dir.path()))?;
    assert_eq!(journal.last_log_id(), Some(LogId::new(2, 10)));
    assert_eq!(journal.try_get(7)?.unwrap().log_id, LogId::new(1, 7));
    assert_eq!(journal.try_get(8)?.unwrap().log_id, LogId::new(2, 8));
    Ok(())
}

#[test]
fn truncate_everything_leaves_an_appendable_journal() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut journal = SegmentedJournal::open(small_segment_config(dir.path()))?;
    journal.append(&entries(1, 1..=12))?;

    journal.truncate_from(1)?;
    assert_eq!(journal.last_log_id(), None);
    journal.append(&entries(3, 1..=2))?;
    assert_eq!(journal.last_log_id(), Some(LogId::new(3, 2)));
    Ok(())
}

#[test]
fn compaction_removes_whole_segments_only() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut journal = SegmentedJournal::open(small_segment_config(dir.path()))?;
    journal.append(&entries(1, 1..=12))?;
    let before = journal.first_index();
    assert_eq!(before, 1);

    journal.compact_through(7)?;
    let first = journal.first_index();
    assert!(first > 1, "compaction should drop leading segments");
    assert!(first <= 8, "compaction must never remove an entry above the boundary");

    // Reads below the compaction point are a distinguishable error.
    let err = journal.read_range(1, 3).unwrap_err();
    assert!(matches!(err, JournalError::Compacted(_)), "unexpected error: {:?}", err);
    assert_eq!(journal.try_get(1)?, None);

    // Everything above the boundary is still readable.
    let read = journal.read_range(8, 13)?;
    assert_eq!(read.iter().map(|e| e.log_id.index).collect::<Vec<_>>(), vec![8, 9, 10, 11, 12]);

    // Compaction state survives a reopen.
    drop(journal);
    let journal = SegmentedJournal::<BlobData>::open(small_segment_config(dir.path()))?;
    assert_eq!(journal.first_index(), first);
    assert_eq!(journal.last_log_id(), Some(LogId::new(1, 12)));
    Ok(())
}

#[test]
fn reset_starts_over_at_the_given_index() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut journal = SegmentedJournal::open(small_segment_config(dir.path()))?;
    journal.append(&entries(1, 1..=12))?;

    journal.reset(101)?;
    assert_eq!(journal.last_log_id(), None);
    assert_eq!(journal.first_index(), 101);

    journal.append(&[entry(5, 101), entry(5, 102)])?;
    assert_eq!(journal.last_log_id(), Some(LogId::new(5, 102)));

    drop(journal);
    let journal = SegmentedJournal::<BlobData>::open(small_segment_config(dir.path()))?;
    assert_eq!(journal.last_log_id(), Some(LogId::new(5, 102)));
    assert_eq!(journal.first_index(), 101);
    Ok(())
}

fn newest_segment_path(dir: &std::path::Path) -> anyhow::Result<std::path::PathBuf> {
    let mut segments: Vec<_> = fs::read_dir(dir)?
        .filter_map(|dirent| dirent.ok())
        .map(|dirent| dirent.path())
        .filter(|path| path.extension().map(|ext| ext == "jrnl").unwrap_or(false))
        .collect();
    segments.sort();
    segments.pop().ok_or_else(|| anyhow::anyhow!("no segment files found"))
}
