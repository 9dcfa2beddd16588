//! Retention manager: prune and compact sealed journal segments.
//!
//! Runs as an occasional batch job beside a live writer. It only ever looks at
//! sealed segments, so the active segment is never moved, deleted or read
//! half-written. Files that vanish mid-operation (another prune, an operator)
//! are counted and skipped.

use crate::error::{Error, Result};
use crate::journal::{
    SEGMENT_PREFIX, SEGMENT_SUFFIX, SegmentFile, SegmentState, list_segments, segment_state,
};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Suffix of the temporary file a compaction writes into.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Marker appended to the first input's name to name a merged run.
pub const COMPACT_MARKER: &str = "-compact";

const SECONDS_PER_DAY: u64 = 86_400;

/// Options for [`prune`].
#[derive(Debug, Clone)]
pub struct PruneConfig {
    pub journal_dir: PathBuf,

    /// Segments modified more than this many days ago are pruned.
    /// Default: 7
    pub keep_days: u32,

    /// Move pruned segments here instead of deleting them.
    pub archive_dir: Option<PathBuf>,

    /// Only report what would be pruned.
    pub dry_run: bool,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            journal_dir: PathBuf::from("./data/wal"),
            keep_days: 7,
            archive_dir: None,
            dry_run: false,
        }
    }
}

/// Outcome of a prune run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Sealed segments older than the retention window.
    pub candidates: usize,
    pub archived: usize,
    pub deleted: usize,
    /// Candidates that disappeared before they could be pruned.
    pub vanished: usize,
}

/// Options for [`compact`].
#[derive(Debug, Clone)]
pub struct CompactConfig {
    pub journal_dir: PathBuf,

    /// Only sealed segments at or below this compressed size are merged.
    /// Default: 5 MB
    pub max_input_size: u64,

    /// File name of the merged segment. Only valid when a single run
    /// qualifies, and it must sort between that run's neighbours.
    /// Default: the run's first segment name with a `-compact` marker
    pub output_name: Option<String>,

    /// Remove inputs once they are fully contained in the output.
    pub delete_originals: bool,

    /// Only report what would be compacted.
    pub dry_run: bool,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self {
            journal_dir: PathBuf::from("./data/wal"),
            max_input_size: 5_000_000,
            output_name: None,
            delete_originals: false,
            dry_run: false,
        }
    }
}

/// Outcome of a compaction run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactReport {
    /// Segments whose contents went into an output (or would, in a dry run).
    pub compacted_from: usize,
    pub removed_originals: usize,
    /// The merged segments written, one per run.
    pub outputs: Vec<PathBuf>,
}

/// Archive or delete sealed segments older than `keep_days`.
pub fn prune(config: &PruneConfig) -> Result<PruneReport> {
    prune_at(config, SystemTime::now())
}

/// [`prune`] against an explicit clock.
pub fn prune_at(config: &PruneConfig, now: SystemTime) -> Result<PruneReport> {
    let keep = Duration::from_secs(u64::from(config.keep_days) * SECONDS_PER_DAY);
    let candidates: Vec<SegmentFile> = list_segments(&config.journal_dir, false)?
        .into_iter()
        .filter(|s| now.duration_since(s.modified).is_ok_and(|age| age > keep))
        .collect();

    let mut report = PruneReport {
        candidates: candidates.len(),
        ..Default::default()
    };

    if config.dry_run {
        for segment in &candidates {
            info!(
                "Dry run: would prune {} ({} bytes)",
                segment.path.display(),
                segment.size_bytes
            );
        }
        return Ok(report);
    }

    if let Some(archive_dir) = &config.archive_dir {
        fs::create_dir_all(archive_dir)?;
    }

    for segment in &candidates {
        let outcome = match &config.archive_dir {
            Some(archive_dir) => {
                let target = archive_dir.join(segment.path.file_name().unwrap_or_default());
                move_file(&segment.path, &target).map(|()| {
                    report.archived += 1;
                    info!("Archived {} to {}", segment.path.display(), target.display());
                })
            }
            None => fs::remove_file(&segment.path).map(|()| {
                report.deleted += 1;
                info!("Deleted {}", segment.path.display());
            }),
        };

        match outcome {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Segment vanished before pruning: {}", segment.path.display());
                report.vanished += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        "Prune finished: {} candidates, {} archived, {} deleted, {} vanished",
        report.candidates, report.archived, report.deleted, report.vanished
    );
    Ok(report)
}

/// Rename, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!("Cross-device move of {}, copying", from.display());
            fs::copy(from, to)?;
            File::open(to)?.sync_all()?;
            fs::remove_file(from)
        }
        other => other,
    }
}

/// Merge runs of small sealed segments.
///
/// Only consecutive segments are merged, and each merged segment is named
/// so that it sorts where its contents were, keeping journal order intact.
/// A run of one segment is left alone. The output is written to a temporary
/// `.partial` file, synced, and renamed into place, so a crash never leaves a
/// half-written segment under a name replay would read. An input is only
/// removed if all of it reached the output.
pub fn compact(config: &CompactConfig) -> Result<CompactReport> {
    if let Some(name) = &config.output_name {
        validate_output_name(name)?;
    }

    let segments = list_segments(&config.journal_dir, true)?;
    let runs = compaction_runs(&segments, config.max_input_size);

    if runs.is_empty() {
        info!("Nothing to compact in {}", config.journal_dir.display());
        return Ok(CompactReport::default());
    }
    if config.output_name.is_some() && runs.len() > 1 {
        return Err(Error::Config(format!(
            "an output name merges a single run, but {} separate runs qualify",
            runs.len()
        )));
    }

    let mut plans = Vec::with_capacity(runs.len());
    for run in runs {
        let inputs = &segments[run.clone()];
        let output_name = match &config.output_name {
            Some(name) => name.clone(),
            None => compacted_name(&inputs[0]),
        };

        // The output must sort strictly between the run's neighbours.
        let before = run.start.checked_sub(1).map(|i| segments[i].sort_key());
        let after = segments.get(run.end).map(SegmentFile::sort_key);
        if before.is_some_and(|b| output_name <= b) || after.is_some_and(|a| output_name >= a) {
            return Err(Error::Config(format!(
                "compaction output {output_name} would not sort between its neighbours"
            )));
        }
        plans.push((output_name, inputs));
    }

    let mut report = CompactReport::default();

    if config.dry_run {
        for (output_name, inputs) in &plans {
            let total: u64 = inputs.iter().map(|s| s.size_bytes).sum();
            info!(
                "Dry run: would compact {} segments ({} bytes) into {}",
                inputs.len(),
                total,
                output_name
            );
            report.compacted_from += inputs.len();
        }
        return Ok(report);
    }

    for (output_name, inputs) in plans {
        compact_run(config, &output_name, inputs, &mut report)?;
    }

    info!(
        "Compacted {} segments into {} outputs ({} originals removed)",
        report.compacted_from,
        report.outputs.len(),
        report.removed_originals
    );
    Ok(report)
}

/// Index ranges of consecutive small sealed segments, two or more long.
fn compaction_runs(segments: &[SegmentFile], max_input_size: u64) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = None;
    for (i, segment) in segments.iter().enumerate() {
        let small = segment.state == SegmentState::Sealed && segment.size_bytes <= max_input_size;
        match (small, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push(s..i);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(s..segments.len());
    }
    runs.retain(|run| run.len() > 1);
    runs
}

/// Default name of a merged run: the first input's name plus a marker, which
/// sorts immediately before that input.
fn compacted_name(first: &SegmentFile) -> String {
    let key = first.sort_key();
    let base = key.strip_suffix(SEGMENT_SUFFIX).unwrap_or(&key);
    format!("{base}{COMPACT_MARKER}{SEGMENT_SUFFIX}")
}

/// An output name must be a plain sealed segment name inside the journal.
fn validate_output_name(name: &str) -> Result<()> {
    let plain = !name.contains(['/', '\\']) && Path::new(name).file_name().is_some_and(|n| n == name);
    if !plain || segment_state(name) != Some(SegmentState::Sealed) {
        return Err(Error::Config(format!(
            "compaction output {name:?} must be a segment file name like {SEGMENT_PREFIX}<stamp>{SEGMENT_SUFFIX}"
        )));
    }
    Ok(())
}

fn compact_run(
    config: &CompactConfig,
    output_name: &str,
    inputs: &[SegmentFile],
    report: &mut CompactReport,
) -> Result<()> {
    let output = config.journal_dir.join(output_name);
    if output.exists() {
        return Err(Error::Segment(format!(
            "compaction output {} already exists",
            output.display()
        )));
    }

    let partial = config
        .journal_dir
        .join(format!("{output_name}{PARTIAL_SUFFIX}"));
    let copied = match write_compacted(inputs, &partial) {
        Ok(copied) => copied,
        Err(e) => {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
    };

    if copied.is_empty() {
        // Every input vanished.
        fs::remove_file(&partial)?;
        return Ok(());
    }

    fs::rename(&partial, &output)?;
    report.compacted_from += copied.len();

    if config.delete_originals {
        for path in copied.iter().filter(|(_, complete)| *complete).map(|(p, _)| p) {
            match fs::remove_file(path) {
                Ok(()) => report.removed_originals += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("Segment vanished before removal: {}", path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    debug!("Compacted {} segments into {}", copied.len(), output.display());
    report.outputs.push(output);
    Ok(())
}

/// Write the decompressed contents of `inputs` into a new segment at `path`.
///
/// Returns each input that contributed, flagged with whether it was copied in
/// full. A truncated input contributes its complete lines only.
fn write_compacted(inputs: &[SegmentFile], path: &Path) -> Result<Vec<(PathBuf, bool)>> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    let mut copied = Vec::with_capacity(inputs.len());

    for input in inputs {
        let source = match File::open(&input.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Segment vanished before compaction: {}", input.path.display());
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let mut data = Vec::new();
        let complete = match MultiGzDecoder::new(source).read_to_end(&mut data) {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    "Segment {} is damaged, copying complete lines only: {}",
                    input.path.display(),
                    e
                );
                let keep = data.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
                data.truncate(keep);
                false
            }
        };

        if !data.is_empty() {
            encoder.write_all(&data)?;
            if data.last() != Some(&b'\n') {
                encoder.write_all(b"\n")?;
            }
        }
        copied.push((input.path.clone(), complete));
    }

    let file = encoder.finish()?;
    file.sync_all()?;
    Ok(copied)
}
