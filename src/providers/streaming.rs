//! Incremental Server-Sent-Events scanner used to extract usage from
//! upstream streaming responses.

use std::io::{BufRead, ErrorKind};

use thiserror::Error;

/// 单个事件的默认上限
pub const DEFAULT_MAX_EVENT_SIZE: usize = 10 * 1024 * 1024;

const DONE_SENTINEL: &[u8] = b"[DONE]";

/// 字段名、冒号与换行符的余量
const LINE_OVERHEAD: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `data:` framed JSON terminated by an optional `data: [DONE]`.
    DoneTerminated,
    /// Google `alt=sse` framing, no sentinel.
    Plain,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed event stream: unexpected field {0:?}")]
    Malformed(String),

    #[error("event exceeds maximum size of {0} bytes")]
    TooLarge(usize),
}

/// Pull-based frame scanner. Call [`Decoder::scan`] until it returns false,
/// then check [`Decoder::err`].
pub struct Decoder<R> {
    reader: R,
    dialect: Dialect,
    max_event_size: usize,
    line: Vec<u8>,
    pending: Vec<u8>,
    has_data: bool,
    data: Vec<u8>,
    done: bool,
    err: Option<DecodeError>,
}

impl<R: BufRead> Decoder<R> {
    pub fn new(reader: R, dialect: Dialect) -> Self {
        Self::with_max_event_size(reader, dialect, DEFAULT_MAX_EVENT_SIZE)
    }

    pub fn with_max_event_size(reader: R, dialect: Dialect, max_event_size: usize) -> Self {
        Self {
            reader,
            dialect,
            max_event_size,
            line: Vec::new(),
            pending: Vec::new(),
            has_data: false,
            data: Vec::new(),
            done: false,
            err: None,
        }
    }

    /// Advances to the next data frame. Returns false on EOF, on a terminal
    /// error or once the `[DONE]` sentinel is seen.
    pub fn scan(&mut self) -> bool {
        if self.done {
            return false;
        }
        loop {
            self.line.clear();
            let read = match self.read_line() {
                Ok(n) => n,
                Err(e) => return self.fail(e),
            };

            if read == 0 {
                // EOF 时仍可能残留一个未以空行结束的事件
                return self.flush_pending() || self.finish();
            }

            let line = trim_line_ending(&self.line);
            if line.is_empty() {
                if self.flush_pending() {
                    return true;
                }
                if self.done {
                    return false;
                }
                continue;
            }

            if line[0] == b':' {
                continue;
            }

            let (field, value) = split_field(line);
            match field {
                b"data" => {
                    let extra = usize::from(self.has_data);
                    if self.pending.len() + extra + value.len() > self.max_event_size {
                        return self.fail(DecodeError::TooLarge(self.max_event_size));
                    }
                    if self.has_data {
                        self.pending.push(b'\n');
                    }
                    self.pending.extend_from_slice(value);
                    self.has_data = true;
                }
                b"event" | b"id" | b"retry" => {}
                other => {
                    let name = String::from_utf8_lossy(other).into_owned();
                    return self.fail(DecodeError::Malformed(name));
                }
            }
        }
    }

    /// Reads one physical line into `self.line`, failing before buffering
    /// more than the event size limit allows.
    fn read_line(&mut self) -> Result<usize, DecodeError> {
        let limit = (self.max_event_size + LINE_OVERHEAD).saturating_sub(self.pending.len());
        let mut total = 0;
        loop {
            let available = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if available.is_empty() {
                return Ok(total);
            }
            let (used, found_newline) = match available.iter().position(|&b| b == b'\n') {
                Some(idx) => (idx + 1, true),
                None => (available.len(), false),
            };
            if self.line.len() + used > limit {
                return Err(DecodeError::TooLarge(self.max_event_size));
            }
            self.line.extend_from_slice(&available[..used]);
            self.reader.consume(used);
            total += used;
            if found_newline {
                return Ok(total);
            }
        }
    }

    /// Payload of the current frame with the `data:` framing stripped.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn err(&self) -> Option<&DecodeError> {
        self.err.as_ref()
    }

    fn flush_pending(&mut self) -> bool {
        if !self.has_data {
            return false;
        }
        self.has_data = false;
        std::mem::swap(&mut self.data, &mut self.pending);
        self.pending.clear();

        if self.dialect == Dialect::DoneTerminated && self.data == DONE_SENTINEL {
            self.data.clear();
            self.done = true;
            return false;
        }
        true
    }

    fn finish(&mut self) -> bool {
        self.done = true;
        self.data.clear();
        false
    }

    fn fail(&mut self, err: DecodeError) -> bool {
        self.err = Some(err);
        self.finish()
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn split_field(line: &[u8]) -> (&[u8], &[u8]) {
    match line.iter().position(|&b| b == b':') {
        Some(idx) => {
            let value = &line[idx + 1..];
            (&line[..idx], value.strip_prefix(b" ").unwrap_or(value))
        }
        None => (line, &[]),
    }
}
