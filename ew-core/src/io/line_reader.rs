//! Newline framing over a non-blocking byte source
//!
//! The source is any [`Read`] that reports "nothing available right now"
//! as [`io::ErrorKind::WouldBlock`] and end-of-stream as `Ok(0)`.
//! [`FramedLineReader::poll`] drains whatever is available, returns every
//! complete line, and keeps the trailing partial line for the next poll.

use std::io::{self, Read};

use ew_error::DecodeError;
use ew_protocol::{LINE_TERMINATOR, MAX_LINE_BYTES};

use crate::constants::limits;

/// Lifecycle of the underlying source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderState {
    Open,
    /// Source returned end-of-stream; any partial line has been flushed
    Ended,
    /// Source returned a hard error; the partial line was dropped
    Failed { reason: String },
}

impl ReaderState {
    pub fn is_open(&self) -> bool {
        matches!(self, ReaderState::Open)
    }
}

/// Result of one poll
#[derive(Debug)]
pub struct PolledLines {
    /// Complete lines in arrival order, or a per-line decode failure
    pub lines: Vec<Result<String, DecodeError>>,
    pub state: ReaderState,
    /// True only on the poll where the source stopped being open
    pub closed_now: bool,
}

impl PolledLines {
    fn idle(state: ReaderState) -> Self {
        Self {
            lines: Vec::new(),
            state,
            closed_now: false,
        }
    }
}

pub struct FramedLineReader<R> {
    source: R,
    buf: Vec<u8>,
    state: ReaderState,
    max_line: usize,
    /// Inside an over-long line; bytes are dropped until the next terminator
    discarding: bool,
    bytes_read: u64,
    lines_emitted: u64,
}

impl<R: Read> FramedLineReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_max_line(source, MAX_LINE_BYTES)
    }

    pub fn with_max_line(source: R, max_line: usize) -> Self {
        Self {
            source,
            buf: Vec::with_capacity(256),
            state: ReaderState::Open,
            max_line: max_line.max(1),
            discarding: false,
            bytes_read: 0,
            lines_emitted: 0,
        }
    }

    /// Collect every complete line available now. Never blocks.
    pub fn poll(&mut self) -> PolledLines {
        if !self.state.is_open() {
            return PolledLines::idle(self.state.clone());
        }

        let mut lines = Vec::new();
        let mut closed_now = false;
        let mut chunk = [0u8; limits::READ_CHUNK_BYTES];

        let mut reads = 0;
        while reads < limits::MAX_READS_PER_POLL {
            match self.source.read(&mut chunk) {
                Ok(0) => {
                    self.flush_partial(&mut lines);
                    self.state = ReaderState::Ended;
                    closed_now = true;
                    break;
                }
                Ok(n) => {
                    reads += 1;
                    self.bytes_read += n as u64;
                    self.ingest(&chunk[..n], &mut lines);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.clear();
                    self.discarding = false;
                    self.state = ReaderState::Failed { reason: e.to_string() };
                    closed_now = true;
                    break;
                }
            }
        }

        self.lines_emitted += lines.len() as u64;
        PolledLines {
            lines,
            state: self.state.clone(),
            closed_now,
        }
    }

    fn ingest(&mut self, mut bytes: &[u8], out: &mut Vec<Result<String, DecodeError>>) {
        while let Some(pos) = bytes.iter().position(|&b| b == LINE_TERMINATOR) {
            if self.discarding {
                // Tail of an over-long line, already reported
                self.discarding = false;
            } else {
                self.buf.extend_from_slice(&bytes[..pos]);
                if self.buf.len() > self.max_line {
                    self.buf.clear();
                    out.push(Err(DecodeError::LineTooLong { limit: self.max_line }));
                } else {
                    self.emit(out);
                }
            }
            bytes = &bytes[pos + 1..];
        }

        if self.discarding {
            return;
        }
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.max_line {
            self.buf.clear();
            self.discarding = true;
            out.push(Err(DecodeError::LineTooLong { limit: self.max_line }));
        }
    }

    fn flush_partial(&mut self, out: &mut Vec<Result<String, DecodeError>>) {
        if self.discarding {
            self.discarding = false;
            self.buf.clear();
            return;
        }
        if !self.buf.is_empty() {
            self.emit(out);
        }
    }

    /// Turn the buffer into one line. Blank lines are skipped.
    fn emit(&mut self, out: &mut Vec<Result<String, DecodeError>>) {
        let mut raw = std::mem::take(&mut self.buf);
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        if raw.is_empty() {
            return;
        }
        let len = raw.len();
        match String::from_utf8(raw) {
            Ok(line) => out.push(Ok(line)),
            Err(e) => out.push(Err(DecodeError::InvalidUtf8 {
                valid_up_to: e.utf8_error().valid_up_to(),
                len,
            })),
        }
    }

    pub fn state(&self) -> &ReaderState {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// Bytes currently held as an incomplete line
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn lines_emitted(&self) -> u64 {
        self.lines_emitted
    }
}
