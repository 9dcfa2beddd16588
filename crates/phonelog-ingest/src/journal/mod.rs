//! The append-only request journal.
//!
//! Every accepted request is written to the journal before any downstream
//! processing. The journal is a directory of gzip-compressed NDJSON segments:
//!
//! ```text
//! events-20240101-000000-0000.ndjson.gz          sealed
//! events-20240101-001512-0000.ndjson.gz          sealed
//! events-20240101-001512-0001.ndjson.gz.active   active (being appended to)
//! ```
//!
//! Names sort in creation order. The timestamp is UTC with second
//! granularity; the four-digit sequence separates segments opened within the
//! same second. A compacted run is named after its first input plus
//! `-compact`, which sorts just before the segments it replaces. Exactly one segment per writer is active; it carries the
//! `.active` suffix until it is sealed by rotation or shutdown. Sealed
//! segments are read-only, and retention only ever touches sealed segments.

mod reader;
mod writer;

pub use reader::{SegmentEntries, SegmentLine};
pub use writer::{JournalConfig, JournalStats, JournalWriter, SealedSegment};

use crate::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// File name prefix shared by every segment.
pub const SEGMENT_PREFIX: &str = "events-";

/// File name suffix of a sealed segment.
pub const SEGMENT_SUFFIX: &str = ".ndjson.gz";

/// Extra suffix carried by the active segment.
pub const ACTIVE_SUFFIX: &str = ".active";

/// Whether a segment may still be appended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Open for appends by a writer (or orphaned by a crash).
    Active,
    /// Closed and read-only.
    Sealed,
}

/// A segment file found on disk.
#[derive(Debug, Clone)]
pub struct SegmentFile {
    /// Full path to the file.
    pub path: PathBuf,

    /// Active or sealed.
    pub state: SegmentState,

    /// Size on disk (compressed) in bytes.
    pub size_bytes: u64,

    /// Last modification time.
    pub modified: SystemTime,
}

impl SegmentFile {
    /// File name without the active suffix; used for ordering.
    pub fn sort_key(&self) -> String {
        let name = file_name(&self.path);
        name.strip_suffix(ACTIVE_SUFFIX).unwrap_or(&name).to_string()
    }
}

/// Build the sealed file name for a segment.
pub fn segment_name(stamp: &str, sequence: u32) -> String {
    format!("{SEGMENT_PREFIX}{stamp}-{sequence:04}{SEGMENT_SUFFIX}")
}

/// Classify a file name as a journal segment.
pub fn segment_state(name: &str) -> Option<SegmentState> {
    if !name.starts_with(SEGMENT_PREFIX) {
        return None;
    }
    if name.ends_with(SEGMENT_SUFFIX) {
        Some(SegmentState::Sealed)
    } else if name
        .strip_suffix(ACTIVE_SUFFIX)
        .is_some_and(|base| base.ends_with(SEGMENT_SUFFIX))
    {
        Some(SegmentState::Active)
    } else {
        None
    }
}

/// List journal segments in creation order.
///
/// A missing directory yields an empty list. Files that disappear while the
/// directory is being scanned are skipped.
pub fn list_segments(dir: &Path, include_active: bool) -> Result<Vec<SegmentFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(state) = segment_state(&name.to_string_lossy()) else {
            continue;
        };
        if state == SegmentState::Active && !include_active {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        segments.push(SegmentFile {
            path: entry.path(),
            state,
            size_bytes: metadata.len(),
            modified: metadata.modified()?,
        });
    }

    segments.sort_by_key(SegmentFile::sort_key);
    Ok(segments)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_segment_name_format() {
        assert_eq!(
            segment_name("20240101-000000", 3),
            "events-20240101-000000-0003.ndjson.gz"
        );
    }

    #[test]
    fn test_segment_state() {
        assert_eq!(
            segment_state("events-20240101-000000-0000.ndjson.gz"),
            Some(SegmentState::Sealed)
        );
        assert_eq!(
            segment_state("events-20240101-000000-0000.ndjson.gz.active"),
            Some(SegmentState::Active)
        );
        // Earlier naming and compaction output are sealed segments too.
        assert_eq!(
            segment_state("events-20240101-000000.ndjson.gz"),
            Some(SegmentState::Sealed)
        );
        assert_eq!(
            segment_state("events-compact-20240101-000000.ndjson.gz"),
            Some(SegmentState::Sealed)
        );
        assert_eq!(segment_state("events-compact.ndjson.gz.partial"), None);
        assert_eq!(segment_state("notes.txt"), None);
    }

    #[test]
    fn test_list_segments_order_and_filter() {
        let tmp = TempDir::new().unwrap();
        for name in [
            "events-20240102-000000-0000.ndjson.gz",
            "events-20240101-000000-0001.ndjson.gz",
            "events-20240101-000000-0000.ndjson.gz",
            "events-20240103-000000-0000.ndjson.gz.active",
            "unrelated.log",
        ] {
            fs::write(tmp.path().join(name), b"").unwrap();
        }

        let sealed = list_segments(tmp.path(), false).unwrap();
        let names: Vec<_> = sealed.iter().map(SegmentFile::sort_key).collect();
        assert_eq!(
            names,
            vec![
                "events-20240101-000000-0000.ndjson.gz",
                "events-20240101-000000-0001.ndjson.gz",
                "events-20240102-000000-0000.ndjson.gz",
            ]
        );

        let all = list_segments(tmp.path(), true).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[3].state, SegmentState::Active);
    }

    #[test]
    fn test_list_segments_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        assert!(list_segments(&missing, true).unwrap().is_empty());
    }
}
