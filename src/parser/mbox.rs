//! Streaming MBOX boundary scanner.
//!
//! Reads the source in fixed-size chunks and yields one [`RawMessageSpan`]
//! per message. Never loads the entire file into memory: the working buffer
//! holds at most the message being assembled plus one read chunk.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::{MigrateError, Result};
use crate::model::message::RawMessageSpan;

/// Size of each read from the source (1 MB for fast sequential reads on modern SSDs).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Skip progress is reported every 10 MB.
pub const DEFAULT_SKIP_PROGRESS_INTERVAL: u64 = 10 * 1024 * 1024;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Incremental MBOX scanner, usable as an iterator of spans.
///
/// Every line of the shape `From <sender> <anything>` anchored at a line
/// start is a boundary, including unescaped `From ` lines inside a body.
/// The scanner is tolerant of:
///
/// - Mixed `\n` and `\r\n` line endings
/// - `From ` lines not preceded by a blank line
/// - Truncated messages and missing trailing newline at EOF
/// - NUL bytes and other binary content in the body
/// - UTF-8 BOM at the start of the file
pub struct MboxScanner<'a, R> {
    reader: R,
    source: PathBuf,
    chunk: Vec<u8>,
    buf: Vec<u8>,
    /// Source offset of `buf[0]`.
    buf_offset: u64,
    /// Start of the next line not yet examined.
    cursor: usize,
    /// Length of the separator line at the head of `buf` (0 if none).
    head_sep_len: usize,
    eof: bool,
    done: bool,
    next_index: u64,
    start_index: u64,
    total_size: u64,
    progress_interval: u64,
    last_progress: u64,
    progress: Option<Box<dyn FnMut(u64, u64) + 'a>>,
}

impl<'a> MboxScanner<'a, File> {
    /// Open an MBOX file for scanning.
    ///
    /// Verifies that the file exists and is readable, but does NOT validate
    /// that it is actually an MBOX.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                MigrateError::FileNotFound(path.to_path_buf())
            } else {
                MigrateError::io(path, e)
            }
        })?;
        let total_size = file
            .metadata()
            .map_err(|e| MigrateError::io(path, e))?
            .len();
        let mut scanner = Self::new(file).with_total_size(total_size);
        scanner.source = path.to_path_buf();
        Ok(scanner)
    }
}

impl<'a, R: Read> MboxScanner<'a, R> {
    /// Wrap any byte stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            source: PathBuf::from("<stream>"),
            chunk: vec![0u8; DEFAULT_CHUNK_SIZE],
            buf: Vec::with_capacity(DEFAULT_CHUNK_SIZE),
            buf_offset: 0,
            cursor: 0,
            head_sep_len: 0,
            eof: false,
            done: false,
            next_index: 0,
            start_index: 0,
            total_size: 0,
            progress_interval: DEFAULT_SKIP_PROGRESS_INTERVAL,
            last_progress: 0,
            progress: None,
        }
    }

    /// Override the read chunk size (minimum 1 byte).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk = vec![0u8; chunk_size.max(1)];
        self
    }

    /// Total source size, passed through to the progress callback.
    pub fn with_total_size(mut self, total_size: u64) -> Self {
        self.total_size = total_size;
        self
    }

    /// Split but do not yield the first `start_index` spans.
    pub fn skip_to(mut self, start_index: u64) -> Self {
        self.start_index = start_index;
        self
    }

    /// Callback receiving `(bytes_scanned, total_bytes)` while skipping.
    pub fn with_skip_progress(
        mut self,
        interval: u64,
        callback: impl FnMut(u64, u64) + 'a,
    ) -> Self {
        self.progress_interval = interval.max(1);
        self.progress = Some(Box::new(callback));
        self
    }

    /// Spans passed over because they lie below the skip point.
    pub fn skipped(&self) -> u64 {
        self.next_index.min(self.start_index)
    }

    /// Bytes consumed from the source so far.
    pub fn position(&self) -> u64 {
        self.buf_offset + self.buf.len() as u64
    }

    /// Find the end of the span at the head of `buf`.
    ///
    /// Returns `None` once the source is exhausted and nothing is buffered.
    fn next_boundary(&mut self) -> Result<Option<usize>> {
        loop {
            if let Some(rel) = memchr_newline(&self.buf[self.cursor..]) {
                let line_end = self.cursor + rel + 1;
                let at_file_start = self.buf_offset == 0 && self.cursor == 0;
                let is_separator =
                    is_mbox_separator(&self.buf[self.cursor..line_end], at_file_start);

                if is_separator && self.cursor > 0 {
                    return Ok(Some(self.cursor));
                }
                if is_separator {
                    self.head_sep_len = line_end;
                }
                self.cursor = line_end;
                continue;
            }

            if !self.eof {
                self.fill()?;
                continue;
            }

            // EOF: the last line has no terminator.
            if self.cursor < self.buf.len() {
                let at_file_start = self.buf_offset == 0 && self.cursor == 0;
                if is_mbox_separator(&self.buf[self.cursor..], at_file_start) {
                    if self.cursor > 0 {
                        return Ok(Some(self.cursor));
                    }
                    self.head_sep_len = self.buf.len();
                }
                self.cursor = self.buf.len();
            }

            if self.buf.is_empty() {
                return Ok(None);
            }
            return Ok(Some(self.buf.len()));
        }
    }

    /// Read one chunk into the working buffer.
    fn fill(&mut self) -> Result<()> {
        loop {
            match self.reader.read(&mut self.chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&self.chunk[..n]);
                    trace!(read = n, buffered = self.buf.len(), "Read chunk");
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(MigrateError::io(&self.source, e)),
            }
        }
    }

    /// Cut `buf[..end]` off as a span.
    ///
    /// Returns `None` for spans below the skip point and for a blank
    /// preamble before the first separator.
    fn take_span(&mut self, end: usize) -> Option<RawMessageSpan> {
        let start_offset = self.buf_offset;
        let sep_len = self.head_sep_len.min(end);
        let blank_preamble =
            sep_len == 0 && self.buf[..end].iter().all(|b| b.is_ascii_whitespace());

        let span = if blank_preamble {
            None
        } else {
            let index = self.next_index;
            self.next_index += 1;
            if index < self.start_index {
                None
            } else {
                Some(RawMessageSpan {
                    index,
                    start_offset,
                    end_offset: start_offset + end as u64,
                    separator: self.buf[..sep_len].to_vec(),
                    raw: self.buf[sep_len..end].to_vec(),
                })
            }
        };

        self.buf.drain(..end);
        self.buf_offset += end as u64;
        self.cursor = 0;
        self.head_sep_len = 0;

        if self.next_index <= self.start_index {
            self.report_skip_progress();
        }
        span
    }

    fn report_skip_progress(&mut self) {
        if self.buf_offset - self.last_progress < self.progress_interval {
            return;
        }
        self.last_progress = self.buf_offset;
        debug!(
            offset = self.buf_offset,
            skipped = self.next_index,
            target = self.start_index,
            "Skipping already migrated messages"
        );
        if let Some(cb) = self.progress.as_mut() {
            cb(self.buf_offset, self.total_size);
        }
    }
}

impl<R: Read> Iterator for MboxScanner<'_, R> {
    type Item = Result<RawMessageSpan>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.next_boundary() {
                Ok(Some(end)) => {
                    if let Some(span) = self.take_span(end) {
                        return Some(Ok(span));
                    }
                }
                Ok(None) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Fast newline search (equivalent to memchr for `\n`).
#[inline]
fn memchr_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

/// Check whether a line is an MBOX separator: `From <sender> <date...>`.
///
/// A BOM is only tolerated on the very first line of the file.
fn is_mbox_separator(line: &[u8], allow_bom: bool) -> bool {
    let line = match line.strip_prefix(UTF8_BOM) {
        Some(rest) if allow_bom => rest,
        _ => line,
    };
    let Some(rest) = line.strip_prefix(b"From ") else {
        return false;
    };
    let sender_len = rest
        .iter()
        .position(|&b| b == b' ' || b == b'\t' || b == b'\r' || b == b'\n')
        .unwrap_or(rest.len());
    if sender_len == 0 {
        return false;
    }
    let after = &rest[sender_len..];
    matches!(after.first(), Some(b' ' | b'\t'))
        && after[1..].iter().any(|b| !b.is_ascii_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(input: &[u8], chunk: usize) -> Vec<RawMessageSpan> {
        MboxScanner::new(input)
            .with_chunk_size(chunk)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_is_mbox_separator() {
        assert!(is_mbox_separator(
            b"From user@example.com Thu Jan 01 00:00:00 2024\n",
            false
        ));
        assert!(is_mbox_separator(
            b"From 1790000000000000000@xxx Mon Feb 12 10:00:00 +0000 2024\r\n",
            false
        ));
        assert!(!is_mbox_separator(b"from user@example.com Thu\n", false)); // lowercase
        assert!(!is_mbox_separator(b">From user@example.com Thu\n", false)); // escaped
        assert!(!is_mbox_separator(b"Subject: From here\n", false));
        assert!(!is_mbox_separator(b"From \n", false));
        assert!(!is_mbox_separator(b"From user@example.com\n", false));
        assert!(!is_mbox_separator(b"From user@example.com   \n", false));
    }

    #[test]
    fn test_is_mbox_separator_with_bom() {
        let mut line = UTF8_BOM.to_vec();
        line.extend_from_slice(b"From user@example.com Thu Jan 01 00:00:00 2024\n");
        assert!(is_mbox_separator(&line, true));
        assert!(!is_mbox_separator(&line, false));
    }

    #[test]
    fn test_spans_are_contiguous() {
        let input = b"From a@x Thu Jan 01 00:00:00 2024\nSubject: 1\n\nOne\n\nFrom b@x Thu Jan 01 00:00:00 2024\nSubject: 2\n\nTwo\n";
        let spans = scan(input, 7);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].index, 0);
        assert_eq!(spans[1].index, 1);
        assert_eq!(spans[0].start_offset, 0);
        assert_eq!(spans[0].end_offset, spans[1].start_offset);
        assert_eq!(spans[1].end_offset, input.len() as u64);
        assert_eq!(spans[0].raw, b"Subject: 1\n\nOne\n\n");
        assert_eq!(spans[1].separator, b"From b@x Thu Jan 01 00:00:00 2024\n");
    }

    #[test]
    fn test_preamble_without_separator() {
        let input = b"Subject: orphan\n\nbody\nFrom a@x Thu Jan 01 00:00:00 2024\nSubject: 1\n\nOne\n";
        let spans = scan(input, 1024);
        assert_eq!(spans.len(), 2);
        assert!(spans[0].separator.is_empty());
        assert_eq!(spans[0].raw, b"Subject: orphan\n\nbody\n");
    }

    #[test]
    fn test_blank_preamble_is_dropped() {
        let input = b"\n\nFrom a@x Thu Jan 01 00:00:00 2024\nSubject: 1\n\nOne\n";
        let spans = scan(input, 3);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].index, 0);
        assert_eq!(spans[0].start_offset, 2);
    }

    #[test]
    fn test_no_trailing_newline() {
        let input = b"From a@x Thu Jan 01 00:00:00 2024\nSubject: 1\n\nOne";
        let spans = scan(input, 4);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].raw, b"Subject: 1\n\nOne");
    }

    #[test]
    fn test_empty_input() {
        assert!(scan(b"", 16).is_empty());
    }

    #[test]
    fn test_skip_to_elides_spans() {
        let mut input = Vec::new();
        for i in 0..5 {
            input.extend_from_slice(
                format!("From s@x Thu Jan 01 00:00:00 2024\nSubject: {i}\n\nbody\n").as_bytes(),
            );
        }
        let mut reports = Vec::new();
        let spans: Vec<_> = MboxScanner::new(input.as_slice())
            .with_chunk_size(10)
            .skip_to(3)
            .with_skip_progress(1, |done, _total| reports.push(done))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].index, 3);
        assert_eq!(spans[1].index, 4);
        assert_eq!(reports.len(), 3);
    }
}
