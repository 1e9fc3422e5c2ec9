//! Incremental reply decoder
//!
//! A byte-stream state machine, not a recursive-descent parser: replies
//! arrive across arbitrary read boundaries, so the decoder keeps an
//! append-only buffer with a consumption mark (nothing is consumed until a
//! complete element is available) and an explicit bounded stack of
//! in-progress multi accumulators for nested arrays. Call depth never grows
//! with reply nesting.

use crate::error::{KvError, Result};
use crate::protocol::value::Value;
use bytes::{Buf, BytesMut};

/// Bulk string payload cap (512 MiB).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Multi element-count cap.
const MAX_MULTI_LEN: i64 = i32::MAX as i64;

/// Consumed-byte threshold above which the buffer is compacted.
const COMPACT_HIGH_WATER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
enum MultiKind {
    Array,
    Push,
}

/// An array or push frame whose elements are still arriving.
struct Multi {
    kind: MultiKind,
    remaining: usize,
    items: Vec<Value>,
}

/// Decoder scan state.
///
/// `Line` scans for a `\r\n`-terminated header; `FixedLen` consumes the
/// announced payload of a bulk string whose header line is already consumed.
#[derive(Debug, Clone, Copy)]
enum ScanState {
    Line,
    FixedLen { len: usize },
}

enum Step {
    /// More bytes needed before anything can be consumed.
    Incomplete,
    /// A multi header was consumed and pushed onto the stack.
    Opened,
    /// A complete element was produced.
    Element(Value),
}

pub struct Decoder {
    buf: BytesMut,
    /// Consumption mark: bytes before `pos` belong to completed elements.
    pos: usize,
    state: ScanState,
    stack: Vec<Multi>,
    max_depth: usize,
}

impl Decoder {
    pub fn new(capacity: usize, max_depth: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            pos: 0,
            state: ScanState::Line,
            stack: Vec::new(),
            max_depth,
        }
    }

    /// Append raw bytes from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Buffer to read into directly (e.g. with `read_buf`).
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Try to produce the next complete reply value.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Any error is fatal to
    /// the connection that owns this decoder.
    pub fn next(&mut self) -> Result<Option<Value>> {
        loop {
            match self.step()? {
                Step::Incomplete => {
                    self.compact();
                    return Ok(None);
                }
                Step::Opened => continue,
                Step::Element(value) => {
                    if let Some(root) = self.complete(value) {
                        self.compact();
                        return Ok(Some(root));
                    }
                }
            }
        }
    }

    /// Deliver a completed element to the open multi, cascading closure up
    /// the stack. Returns the root value once the stack empties.
    fn complete(&mut self, value: Value) -> Option<Value> {
        let mut value = value;
        loop {
            let top = match self.stack.last_mut() {
                Some(top) => top,
                None => return Some(value),
            };
            top.items.push(value);
            top.remaining -= 1;
            if top.remaining > 0 {
                return None;
            }
            let done = self.stack.pop().expect("stack nonempty");
            value = match done.kind {
                MultiKind::Array => Value::Array(Some(done.items)),
                MultiKind::Push => Value::Push(done.items),
            };
        }
    }

    fn step(&mut self) -> Result<Step> {
        match self.state {
            ScanState::FixedLen { len } => self.step_fixed(len),
            ScanState::Line => self.step_line(),
        }
    }

    /// Consume exactly `len` payload bytes plus the trailing CRLF.
    fn step_fixed(&mut self, len: usize) -> Result<Step> {
        let end = self.pos + len + 2;
        if self.buf.len() < end {
            return Ok(Step::Incomplete);
        }
        if &self.buf[self.pos + len..end] != b"\r\n" {
            return Err(KvError::Protocol(
                "bulk string payload not CRLF terminated".to_string(),
            ));
        }
        let payload = self.buf[self.pos..self.pos + len].to_vec();
        self.pos = end;
        self.state = ScanState::Line;
        Ok(Step::Element(Value::Bulk(Some(payload.into()))))
    }

    fn step_line(&mut self) -> Result<Step> {
        let line_end = match self.find_crlf() {
            Some(end) => end,
            None => return Ok(Step::Incomplete),
        };
        let line_start = self.pos + 1;
        let type_byte = self.buf[self.pos];

        let step = match type_byte {
            b'+' => {
                let body = &self.buf[line_start..line_end];
                // Fast path for the most common status reply.
                let value = if body == b"OK" {
                    Value::ok()
                } else {
                    Value::Simple(String::from_utf8_lossy(body).into_owned())
                };
                Step::Element(value)
            }
            b'-' => {
                let body = &self.buf[line_start..line_end];
                Step::Element(Value::Error(String::from_utf8_lossy(body).into_owned()))
            }
            b':' => {
                let n = parse_decimal(&self.buf[line_start..line_end])
                    .ok_or_else(|| KvError::Protocol("malformed integer reply".to_string()))?;
                Step::Element(Value::Integer(n))
            }
            b'$' => {
                let len = parse_decimal(&self.buf[line_start..line_end])
                    .ok_or_else(|| KvError::Protocol("malformed bulk length".to_string()))?;
                match len {
                    -1 => Step::Element(Value::Bulk(None)),
                    len if len < 0 => {
                        return Err(KvError::Protocol(format!("negative bulk length {}", len)))
                    }
                    len if len > MAX_BULK_LEN => {
                        return Err(KvError::Protocol(format!(
                            "bulk length {} exceeds 512MiB cap",
                            len
                        )))
                    }
                    len => {
                        // Header consumed; payload read continues in the
                        // fixed-length state across future feeds.
                        self.pos = line_end + 2;
                        self.state = ScanState::FixedLen { len: len as usize };
                        return Ok(Step::Opened);
                    }
                }
            }
            b'*' => self.open_multi(MultiKind::Array, line_start, line_end)?,
            b'>' => self.open_multi(MultiKind::Push, line_start, line_end)?,
            b'_' => Step::Element(Value::Null),
            b',' | b'#' | b'=' | b'(' | b'!' | b'%' | b'~' | b'|' => {
                return Err(KvError::Protocol(format!(
                    "unsupported reply type '{}'",
                    type_byte as char
                )));
            }
            other => {
                return Err(KvError::Protocol(format!(
                    "invalid reply type byte 0x{:02x}",
                    other
                )));
            }
        };

        self.pos = line_end + 2;
        Ok(step)
    }

    fn open_multi(&mut self, kind: MultiKind, line_start: usize, line_end: usize) -> Result<Step> {
        let len = parse_decimal(&self.buf[line_start..line_end])
            .ok_or_else(|| KvError::Protocol("malformed multi length".to_string()))?;
        match len {
            -1 if kind == MultiKind::Array => Ok(Step::Element(Value::Array(None))),
            0 => Ok(Step::Element(match kind {
                MultiKind::Array => Value::empty_array(),
                MultiKind::Push => Value::Push(Vec::new()),
            })),
            len if len < 0 => Err(KvError::Protocol(format!("negative multi length {}", len))),
            len if len > MAX_MULTI_LEN => Err(KvError::Protocol(format!(
                "multi length {} exceeds cap",
                len
            ))),
            len => {
                if self.stack.len() >= self.max_depth {
                    return Err(KvError::Protocol(format!(
                        "reply nesting exceeds depth limit {}",
                        self.max_depth
                    )));
                }
                // The count is server-announced; cap the reservation and let
                // the vec grow as elements actually arrive.
                self.stack.push(Multi {
                    kind,
                    remaining: len as usize,
                    items: Vec::with_capacity((len as usize).min(4096)),
                });
                Ok(Step::Opened)
            }
        }
    }

    fn find_crlf(&self) -> Option<usize> {
        let hay = &self.buf[self.pos..];
        hay.windows(2)
            .position(|w| w == b"\r\n")
            .map(|i| self.pos + i)
    }

    /// Reclaim already-consumed bytes once the high-water mark is exceeded.
    fn compact(&mut self) {
        if self.pos >= COMPACT_HIGH_WATER {
            self.buf.advance(self.pos);
            self.pos = 0;
        }
    }
}

fn parse_decimal(bytes: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(bytes).ok()?;
    s.parse::<i64>().ok()
}
