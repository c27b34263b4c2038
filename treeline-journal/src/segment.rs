//! Segment file naming and handling.

use std::fs;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Metadata of one segment file.
///
/// A segment is named by the absolute index of the first entry it holds. `last_index` and
/// `last_term` track the newest entry, maintained at recovery and on every append.
#[derive(Debug)]
pub(crate) struct SegmentMeta {
    pub first_index: u64,
    pub last_index: u64,
    pub last_term: u64,
    pub path: PathBuf,
    /// Byte length of the segment file.
    pub len: u64,
    pub entry_count: u64,
}

/// Generate a segment filename from the absolute index of its first entry.
pub(crate) fn segment_filename(first_index: u64) -> String {
    format!("seg_{:020}.jrnl", first_index)
}

/// Parse the first-entry index back out of a segment filename.
pub(crate) fn parse_segment_filename(filename: &str) -> Option<u64> {
    let digits = filename.strip_prefix("seg_")?.strip_suffix(".jrnl")?;
    if digits.len() != 20 {
        return None;
    }
    digits.parse().ok()
}

/// List all segment files in `dir`, sorted by first index.
pub(crate) fn list_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let path = dirent.path();
        if let Some(filename) = path.file_name().and_then(|name| name.to_str()) {
            if let Some(first_index) = parse_segment_filename(filename) {
                segments.push((first_index, path));
            }
        }
    }
    segments.sort_by_key(|(first_index, _)| *first_index);
    Ok(segments)
}

/// Create a new, empty segment file for entries starting at `first_index`.
pub(crate) fn create_segment(dir: &Path, first_index: u64) -> io::Result<(SegmentMeta, File)> {
    let path = dir.join(segment_filename(first_index));
    let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
    Ok((
        SegmentMeta {
            first_index,
            last_index: 0,
            last_term: 0,
            path,
            len: 0,
            entry_count: 0,
        },
        file,
    ))
}

/// Open an existing segment file for appending.
pub(crate) fn open_segment_for_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().append(true).open(path)
}

/// Atomically replace a segment file's content: write to a temp sibling, fsync, rename.
pub(crate) fn rewrite_segment(path: &Path, content: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("jrnl.tmp");
    {
        let mut tmp = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
        tmp.write_all(content)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_roundtrip() {
        let name = segment_filename(42);
        assert_eq!(name, "seg_00000000000000000042.jrnl");
        assert_eq!(parse_segment_filename(&name), Some(42));
    }

    #[test]
    fn filenames_sort_numerically() {
        let mut names = vec![segment_filename(100), segment_filename(2), segment_filename(30)];
        names.sort();
        assert_eq!(
            names.iter().map(|n| parse_segment_filename(n).unwrap()).collect::<Vec<_>>(),
            vec![2, 30, 100]
        );
    }

    #[test]
    fn foreign_files_are_not_segments() {
        assert_eq!(parse_segment_filename("seg_123.jrnl"), None);
        assert_eq!(parse_segment_filename("seg_00000000000000000042.jrnl.tmp"), None);
        assert_eq!(parse_segment_filename("hard_state.json"), None);
    }
}
