//! Sequential reader for journal segments.
//!
//! Segments are read through a multi-member gzip decoder so that files made
//! of concatenated members decode in full. A segment whose gzip stream ends
//! early (a crash before the trailer was written) yields every complete line
//! before the break and then a single [`SegmentLine::Truncated`].

use crate::Result;
use flate2::read::MultiGzDecoder;
use phonelog_core::JournalEntry;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

/// One line read from a segment.
#[derive(Debug)]
pub enum SegmentLine {
    /// A decoded entry.
    Entry { line: usize, entry: JournalEntry },
    /// A line that is not a valid journal entry.
    Invalid { line: usize, error: String },
    /// The stream ended unexpectedly; nothing follows.
    Truncated { line: usize, error: String },
}

/// Iterator over the entries of one segment, in file order.
pub struct SegmentEntries {
    reader: Box<dyn BufRead + Send>,
    line: usize,
    done: bool,
    buf: Vec<u8>,
}

impl SegmentEntries {
    /// Open a segment. Files ending in `.gz` or `.gz.active` are decompressed.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let name = path.to_string_lossy();
        let reader: Box<dyn Read + Send> =
            if name.ends_with(".gz") || name.ends_with(".gz.active") {
                Box::new(MultiGzDecoder::new(file))
            } else {
                Box::new(file)
            };
        Ok(Self::from_reader(reader))
    }

    /// Read entries from an already-decompressed stream.
    pub fn from_reader(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader: Box::new(BufReader::new(reader)),
            line: 0,
            done: false,
            buf: Vec::new(),
        }
    }
}

impl Iterator for SegmentEntries {
    type Item = SegmentLine;

    fn next(&mut self) -> Option<SegmentLine> {
        loop {
            if self.done {
                return None;
            }

            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    self.line += 1;
                    return Some(SegmentLine::Truncated {
                        line: self.line,
                        error: e.to_string(),
                    });
                }
            }
            self.line += 1;

            // A final line without a newline is a partial write.
            let complete = self.buf.last() == Some(&b'\n');
            let text = String::from_utf8_lossy(&self.buf);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }

            return Some(match JournalEntry::from_line(text) {
                Ok(entry) => SegmentLine::Entry {
                    line: self.line,
                    entry,
                },
                Err(e) if !complete => {
                    self.done = true;
                    SegmentLine::Truncated {
                        line: self.line,
                        error: e.to_string(),
                    }
                }
                Err(e) => SegmentLine::Invalid {
                    line: self.line,
                    error: e.to_string(),
                },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    const GOOD: &str = r#"{"received_at_millis":1,"payload":{"locations":[]},"api_version":"v1"}"#;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn collect(path: &Path) -> Vec<SegmentLine> {
        SegmentEntries::open(path).unwrap().collect()
    }

    #[test]
    fn test_reads_entries_and_skips_blank_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events-x.ndjson.gz");
        std::fs::write(&path, gzip(format!("{GOOD}\n\n{GOOD}\n").as_bytes())).unwrap();

        let lines = collect(&path);
        assert_eq!(lines.len(), 2);
        assert!(matches!(lines[0], SegmentLine::Entry { line: 1, .. }));
        assert!(matches!(lines[1], SegmentLine::Entry { line: 3, .. }));
    }

    #[test]
    fn test_invalid_line_does_not_stop_reading() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events-x.ndjson.gz");
        let data = format!("{GOOD}\nnot json\n{{\"payload\": 5, \"received_at_millis\": 1}}\n{GOOD}\n");
        std::fs::write(&path, gzip(data.as_bytes())).unwrap();

        let lines = collect(&path);
        assert_eq!(lines.len(), 4);
        assert!(matches!(lines[1], SegmentLine::Invalid { line: 2, .. }));
        assert!(matches!(lines[2], SegmentLine::Invalid { line: 3, .. }));
        assert!(matches!(lines[3], SegmentLine::Entry { line: 4, .. }));
    }

    #[test]
    fn test_concatenated_members() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events-x.ndjson.gz");
        let mut data = gzip(format!("{GOOD}\n").as_bytes());
        data.extend(gzip(format!("{GOOD}\n").as_bytes()));
        std::fs::write(&path, data).unwrap();

        assert_eq!(collect(&path).len(), 2);
    }

    #[test]
    fn test_truncated_stream() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events-x.ndjson.gz");
        let body = format!("{GOOD}\n").repeat(50);
        let mut data = gzip(body.as_bytes());
        data.truncate(data.len() / 2);
        std::fs::write(&path, data).unwrap();

        let lines = collect(&path);
        assert!(matches!(lines.last(), Some(SegmentLine::Truncated { .. })));
        assert!(
            lines[..lines.len() - 1]
                .iter()
                .all(|l| matches!(l, SegmentLine::Entry { .. }))
        );
    }

    #[test]
    fn test_plain_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events.ndjson");
        std::fs::write(&path, format!("{GOOD}\n{GOOD}")).unwrap();

        let lines = collect(&path);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| matches!(l, SegmentLine::Entry { .. })));
    }
}
