//! Journal writer: durable, rotating, append-only segments.
//!
//! This module provides the [`JournalWriter`] which appends [`JournalEntry`]
//! lines to the active segment and seals it once it reaches a size threshold.
//!
//! # Durability
//!
//! [`JournalWriter::append`] writes the line into the gzip stream, sync-flushes
//! the compressor into the file and (by default) `fsync`s the file before
//! returning. A crash can therefore lose at most the gzip trailer of the
//! active segment; readers tolerate a truncated final member.
//!
//! # Sealing
//!
//! After each append the on-disk size of the active segment is checked. Once
//! it meets or exceeds `rotate_bytes`:
//! 1. The gzip stream is finished and the file synced
//! 2. The `.active` suffix is dropped by an atomic rename
//! 3. The next append lazily opens a new segment
//!
//! The whole append / size check / seal sequence runs under one lock, so
//! concurrent appends never interleave within a segment or race on rotation.
//! A writer does not coordinate with other writer instances; run one writer
//! per journal directory.

use super::{ACTIVE_SUFFIX, SegmentState, segment_name, segment_state};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use phonelog_core::JournalEntry;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Configuration for the journal writer.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Directory holding the segments.
    pub dir: PathBuf,

    /// Compressed size at which the active segment is sealed.
    /// Default: 100 MB
    pub rotate_bytes: u64,

    /// `fsync` the segment after every append.
    /// Default: true
    pub fsync: bool,

    /// Gzip compression level (0-9).
    /// Default: 6
    pub compression_level: u32,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/wal"),
            rotate_bytes: 100_000_000,
            fsync: true,
            compression_level: 6,
        }
    }
}

/// Information about a sealed segment.
#[derive(Debug, Clone)]
pub struct SealedSegment {
    /// Path of the sealed file.
    pub path: PathBuf,

    /// Number of entries appended by this writer.
    pub entry_count: usize,

    /// Uncompressed bytes appended (including newlines).
    pub bytes_written: u64,

    /// Compressed size on disk.
    pub size_bytes: u64,

    /// When the segment was sealed.
    pub sealed_at: DateTime<Utc>,
}

/// The segment currently open for appends.
struct ActiveSegment {
    encoder: GzEncoder<File>,
    active_path: PathBuf,
    sealed_path: PathBuf,
    entry_count: usize,
    bytes_written: u64,
    disk_bytes: u64,
}

/// Mutable writer state, guarded by a single lock.
#[derive(Default)]
struct WriterState {
    active: Option<ActiveSegment>,
    /// Timestamp and sequence of the most recently opened segment.
    last_name: Option<(String, u32)>,
}

/// Append-only journal writer.
///
/// Thread-safe: all appends and rotation decisions are serialized internally.
pub struct JournalWriter {
    config: JournalConfig,
    state: Mutex<WriterState>,
    total_entries: AtomicU64,
    total_bytes: AtomicU64,
    segments_sealed: AtomicU64,
}

impl JournalWriter {
    /// Open a journal writer on a directory.
    ///
    /// Creates the directory if needed and seals any `.active` segments left
    /// behind by a previous process that did not shut down cleanly.
    pub fn open(config: JournalConfig) -> Result<Self> {
        if config.rotate_bytes == 0 {
            return Err(Error::Config("rotate_bytes must be greater than zero".into()));
        }

        fs::create_dir_all(&config.dir)?;
        let recovered = Self::seal_orphans(&config.dir)?;

        info!(
            "JournalWriter initialized: dir={}, rotate_bytes={}, fsync={}, recovered {} orphaned segments",
            config.dir.display(),
            config.rotate_bytes,
            config.fsync,
            recovered
        );

        Ok(Self {
            config,
            state: Mutex::new(WriterState::default()),
            total_entries: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            segments_sealed: AtomicU64::new(0),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Rename leftover `.active` files to their sealed names.
    fn seal_orphans(dir: &Path) -> Result<usize> {
        let mut sealed = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if segment_state(&name) != Some(SegmentState::Active) {
                continue;
            }

            let Some(base) = name.strip_suffix(ACTIVE_SUFFIX) else {
                continue;
            };
            let target = dir.join(base);
            if target.exists() {
                warn!(
                    "Orphaned segment {} left in place: {} already exists",
                    name,
                    target.display()
                );
                continue;
            }

            match fs::rename(entry.path(), &target) {
                Ok(()) => {
                    warn!("Sealed orphaned segment {}", target.display());
                    sealed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(sealed)
    }

    /// Pick the paths for the next segment.
    ///
    /// Names never go backwards even if the wall clock does, and never
    /// collide with an existing file.
    fn next_segment_paths(&self, state: &mut WriterState, now: DateTime<Utc>) -> (PathBuf, PathBuf) {
        let stamp_now = now.format("%Y%m%d-%H%M%S").to_string();
        let (stamp, mut sequence) = match &state.last_name {
            Some((last, last_seq)) if *last >= stamp_now => (last.clone(), last_seq + 1),
            _ => (stamp_now, 0),
        };

        loop {
            let name = segment_name(&stamp, sequence);
            let sealed = self.config.dir.join(&name);
            let active = self.config.dir.join(format!("{name}{ACTIVE_SUFFIX}"));
            if !sealed.exists() && !active.exists() {
                state.last_name = Some((stamp, sequence));
                return (active, sealed);
            }
            sequence += 1;
        }
    }

    /// Open a fresh active segment.
    fn open_segment(&self, state: &mut WriterState) -> Result<()> {
        let (active_path, sealed_path) = self.next_segment_paths(state, Utc::now());

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&active_path)
            .map_err(|e| {
                Error::Journal(format!("failed to open {}: {}", active_path.display(), e))
            })?;

        info!("Journal segment opened: {}", active_path.display());

        state.active = Some(ActiveSegment {
            encoder: GzEncoder::new(file, Compression::new(self.config.compression_level)),
            active_path,
            sealed_path,
            entry_count: 0,
            bytes_written: 0,
            disk_bytes: 0,
        });
        Ok(())
    }

    /// Durably append one entry.
    ///
    /// When this returns `Ok`, the entry is on stable storage. Returns `true`
    /// if the active segment was sealed as a result.
    ///
    /// If the active segment is unlinked underneath the writer, the write only
    /// reached the orphaned inode; the line is written again into a fresh
    /// segment before returning. A second disappearance is a journal failure.
    pub fn append(&self, entry: &JournalEntry) -> Result<bool> {
        let mut line = entry
            .to_line()
            .map_err(|e| Error::Journal(format!("failed to encode entry: {e}")))?;
        line.push('\n');

        let mut state = self.state.lock();
        let mut reopened = false;

        let should_seal = loop {
            if state.active.is_none() {
                self.open_segment(&mut state)?;
            }
            let segment = state
                .active
                .as_mut()
                .ok_or_else(|| Error::Segment("No active segment".to_string()))?;

            if let Err(e) = Self::write_durably(segment, line.as_bytes(), self.config.fsync) {
                // The stream may be half-written; start over on the next append.
                let path = segment.active_path.clone();
                if let Some(broken) = state.active.take() {
                    Self::abandon(broken);
                }
                metrics::counter!("ingest_journal_failures_total").increment(1);
                return Err(Error::Journal(format!(
                    "failed to append to {}: {}",
                    path.display(),
                    e
                )));
            }
            segment.entry_count += 1;
            segment.bytes_written += line.len() as u64;

            match fs::metadata(&segment.active_path) {
                Ok(metadata) => {
                    segment.disk_bytes = metadata.len();
                    metrics::gauge!("journal_current_bytes").set(metadata.len() as f64);
                    break metadata.len() >= self.config.rotate_bytes;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(
                        "Active journal segment vanished: {}",
                        segment.active_path.display()
                    );
                    state.active = None;
                    if reopened {
                        metrics::counter!("ingest_journal_failures_total").increment(1);
                        return Err(Error::Journal(
                            "journal segment vanished twice during one append".to_string(),
                        ));
                    }
                    reopened = true;
                }
                Err(e) => {
                    warn!(
                        "Failed to stat journal segment {}: {}",
                        segment.active_path.display(),
                        e
                    );
                    break false;
                }
            }
        };

        self.total_entries.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(line.len() as u64, Ordering::Relaxed);
        metrics::counter!("journal_entries_written_total").increment(1);
        metrics::counter!("journal_bytes_written_total").increment(line.len() as u64);

        if should_seal {
            // The entry is already durable; a failed seal must not fail it.
            if let Err(e) = self.seal_locked(&mut state) {
                error!("Failed to seal journal segment: {}", e);
                state.active = None;
            }
            return Ok(true);
        }

        Ok(false)
    }

    fn write_durably(segment: &mut ActiveSegment, bytes: &[u8], fsync: bool) -> io::Result<()> {
        segment.encoder.write_all(bytes)?;
        // Sync-flush the compressor so the bytes are in the file, not in zlib.
        segment.encoder.flush()?;
        if fsync {
            segment.encoder.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Best-effort close of a segment whose stream can no longer be trusted.
    fn abandon(segment: ActiveSegment) {
        let ActiveSegment {
            encoder,
            active_path,
            sealed_path,
            ..
        } = segment;
        drop(encoder.finish());
        if let Err(e) = fs::rename(&active_path, &sealed_path) {
            warn!(
                "Failed to seal abandoned segment {}: {}",
                active_path.display(),
                e
            );
        }
    }

    fn seal_locked(&self, state: &mut WriterState) -> Result<Option<SealedSegment>> {
        let Some(segment) = state.active.take() else {
            return Ok(None);
        };

        let ActiveSegment {
            encoder,
            active_path,
            sealed_path,
            entry_count,
            bytes_written,
            disk_bytes,
        } = segment;

        let file = encoder.finish()?;
        if self.config.fsync {
            file.sync_all()?;
        }
        let size_bytes = file.metadata().map(|m| m.len()).unwrap_or(disk_bytes);
        drop(file);

        match fs::rename(&active_path, &sealed_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "Journal segment vanished before sealing: {}",
                    active_path.display()
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        self.segments_sealed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("journal_segments_sealed_total").increment(1);
        metrics::gauge!("journal_current_bytes").set(0.0);

        info!(
            "Sealed journal segment {}: {} entries, {} bytes -> {} bytes",
            sealed_path.display(),
            entry_count,
            bytes_written,
            size_bytes
        );

        Ok(Some(SealedSegment {
            path: sealed_path,
            entry_count,
            bytes_written,
            size_bytes,
            sealed_at: Utc::now(),
        }))
    }

    /// Seal the active segment, if any.
    pub fn seal(&self) -> Result<Option<SealedSegment>> {
        let mut state = self.state.lock();
        self.seal_locked(&mut state)
    }

    /// Get statistics about the writer.
    pub fn stats(&self) -> JournalStats {
        let state = self.state.lock();
        let current = state.active.as_ref();

        JournalStats {
            total_entries: self.total_entries.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            segments_sealed: self.segments_sealed.load(Ordering::Relaxed),
            current_segment: current.map(|s| s.active_path.clone()),
            current_segment_entries: current.map_or(0, |s| s.entry_count),
            current_segment_bytes: current.map_or(0, |s| s.disk_bytes),
        }
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        if let Err(e) = self.seal() {
            warn!("Error sealing journal segment on drop: {}", e);
        }
        debug!("JournalWriter closed");
    }
}

/// Statistics about the journal writer.
#[derive(Debug, Clone)]
pub struct JournalStats {
    /// Entries appended since the writer was opened.
    pub total_entries: u64,

    /// Uncompressed bytes appended since the writer was opened.
    pub total_bytes: u64,

    /// Segments sealed by this writer.
    pub segments_sealed: u64,

    /// Path of the active segment, if one is open.
    pub current_segment: Option<PathBuf>,

    /// Entries in the active segment.
    pub current_segment_entries: usize,

    /// Compressed bytes of the active segment as of the last append.
    pub current_segment_bytes: u64,
}
