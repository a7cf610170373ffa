//! Bounded NDJSON reader over a gzipped archive stream.
//!
//! Lines above the 32 MiB token limit are dropped, JSON that fails to parse
//! is skipped, and both are counted rather than failing the hour. The reader
//! keeps a bounded sample of the first valid line for diagnostics.

use std::io::{BufRead, BufReader, Read};

use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::ArchiveError;
use crate::extract::envelope::{parse_envelope, Envelope};

/// Longest accepted NDJSON line.
const MAX_LINE_BYTES: usize = 32 * 1024 * 1024;

/// Diagnostic sample ceiling.
const SAMPLE_BYTES: usize = 2048;

/// Counters accumulated while reading one archive file.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderStats {
    /// Lines inspected, including dropped ones.
    pub lines: u64,
    /// Lines dropped for exceeding the token limit.
    pub oversize_dropped: u64,
    /// Lines skipped because they were not valid event JSON.
    pub malformed: u64,
    /// Decompressed bytes consumed.
    pub bytes_read: u64,
}

/// Streaming envelope iterator over one `.json.gz` archive file.
pub struct EventReader<R: Read> {
    inner: BufReader<GzDecoder<R>>,
    stats: ReaderStats,
    sample: Option<String>,
    line: Vec<u8>,
    done: bool,
}

impl<R: Read> EventReader<R> {
    pub fn new(raw: R) -> Self {
        Self {
            inner: BufReader::with_capacity(256 * 1024, GzDecoder::new(raw)),
            stats: ReaderStats::default(),
            sample: None,
            line: Vec::new(),
            done: false,
        }
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    /// Bounded sample of the first valid line, for operator diagnostics.
    pub fn sample(&self) -> Option<&str> {
        self.sample.as_deref()
    }

    /// Reads the next line into `self.line`, enforcing the byte limit.
    /// Returns false at end of stream. An oversize line is consumed to its
    /// newline, counted, and the next line is tried.
    fn next_line(&mut self) -> Result<bool, ArchiveError> {
        loop {
            self.line.clear();
            let mut oversize = false;
            let mut saw_any = false;
            loop {
                let chunk = self.inner.fill_buf()?;
                if chunk.is_empty() {
                    // EOF: a trailing unterminated line still counts.
                    if !saw_any {
                        return Ok(false);
                    }
                    break;
                }
                saw_any = true;
                let (consume, complete) = match chunk.iter().position(|&b| b == b'\n') {
                    Some(pos) => (pos + 1, true),
                    None => (chunk.len(), false),
                };
                if !oversize {
                    self.line.extend_from_slice(&chunk[..consume]);
                    if self.line.len() > MAX_LINE_BYTES {
                        oversize = true;
                        self.line = Vec::new();
                    }
                }
                self.inner.consume(consume);
                self.stats.bytes_read += consume as u64;
                if complete {
                    break;
                }
            }

            self.stats.lines += 1;
            if oversize {
                self.stats.oversize_dropped += 1;
                debug!("dropped oversize archive line");
                continue;
            }
            if self.line.last() == Some(&b'\n') {
                self.line.pop();
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
            }
            if self.line.is_empty() {
                continue;
            }
            return Ok(true);
        }
    }

    fn capture_sample(&mut self, line: &str) {
        if self.sample.is_some() {
            return;
        }
        let mut end = line.len().min(SAMPLE_BYTES);
        while end > 0 && !line.is_char_boundary(end) {
            end -= 1;
        }
        self.sample = Some(line[..end].to_string());
    }
}

impl<R: Read> Iterator for EventReader<R> {
    type Item = Result<Envelope, ArchiveError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.next_line() {
                Ok(false) => return None,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
                Ok(true) => {}
            }
            // Archive lines are produced as UTF-8; repair anything that is not.
            let text = String::from_utf8_lossy(&self.line).into_owned();
            let value: serde_json::Value = match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(_) => {
                    self.stats.malformed += 1;
                    continue;
                }
            };
            match parse_envelope(&value) {
                Some(envelope) => {
                    self.capture_sample(&text);
                    return Some(Ok(envelope));
                }
                None => {
                    self.stats.malformed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gz(lines: &[&str]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
        for line in lines {
            enc.write_all(line.as_bytes()).unwrap();
            enc.write_all(b"\n").unwrap();
        }
        enc.finish().unwrap()
    }

    fn push_event(id: &str) -> String {
        format!(
            r#"{{"id":"{id}","type":"PushEvent","actor":{{"id":7,"login":"octocat"}},"repo":{{"id":42,"name":"octo/repo"}},"payload":{{"commits":[{{"sha":"abc","message":"fix"}}]}},"public":true,"created_at":"2015-01-02T03:04:05Z"}}"#
        )
    }

    #[test]
    fn reads_envelopes_in_file_order() {
        let bytes = gz(&[&push_event("1"), &push_event("2"), &push_event("3")]);
        let reader = EventReader::new(bytes.as_slice());
        let ids: Vec<String> = reader.map(|e| e.unwrap().id).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn skips_malformed_lines_and_counts_them() {
        let bytes = gz(&[
            "{ not json",
            &push_event("1"),
            "[1,2,3]",
            &push_event("2"),
        ]);
        let mut reader = EventReader::new(bytes.as_slice());
        let mut ids = Vec::new();
        for item in reader.by_ref() {
            ids.push(item.unwrap().id);
        }
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(reader.stats().malformed, 2);
        assert_eq!(reader.stats().lines, 4);
    }

    #[test]
    fn drops_oversize_lines() {
        let huge = format!(r#"{{"pad":"{}"}}"#, "x".repeat(MAX_LINE_BYTES));
        let bytes = gz(&[&huge, &push_event("1")]);
        let mut reader = EventReader::new(bytes.as_slice());
        let mut ids = Vec::new();
        for item in reader.by_ref() {
            ids.push(item.unwrap().id);
        }
        assert_eq!(ids, vec!["1"]);
        assert_eq!(reader.stats().oversize_dropped, 1);
    }

    #[test]
    fn captures_bounded_sample_from_first_valid_line() {
        let bytes = gz(&["not json at all", &push_event("1")]);
        let mut reader = EventReader::new(bytes.as_slice());
        assert!(reader.sample().is_none());
        let first = reader.next().unwrap().unwrap();
        assert_eq!(first.id, "1");
        let sample = reader.sample().unwrap();
        assert!(sample.starts_with("{\"id\":\"1\""));
        assert!(sample.len() <= SAMPLE_BYTES);
    }

    #[test]
    fn handles_blank_lines_and_missing_trailing_newline() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
        enc.write_all(b"\n\n").unwrap();
        enc.write_all(push_event("9").as_bytes()).unwrap();
        let bytes = enc.finish().unwrap();
        let ids: Vec<String> = EventReader::new(bytes.as_slice())
            .map(|e| e.unwrap().id)
            .collect();
        assert_eq!(ids, vec!["9"]);
    }

    #[test]
    fn corrupt_gzip_surfaces_an_error_then_stops() {
        let mut bytes = gz(&[&push_event("1")]);
        bytes.truncate(bytes.len() / 2);
        let mut reader = EventReader::new(bytes.as_slice());
        let mut saw_error = false;
        for item in reader.by_ref() {
            if item.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert!(reader.next().is_none());
    }
}
