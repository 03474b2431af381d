//! Wire framing
//!
//! Every frame is one line of text terminated by `\n`. Bodies that may contain
//! newlines (file chunks and blobs) carry [`NEWLINE_PLACEHOLDER`] instead, and
//! carriage returns are dropped.

use std::fmt;
use std::time::{Duration, Instant};

/// Prefix of interactive device commands; also what the firmware echoes back
pub const COMMAND_TAG: &str = "CMD:";

/// Prefix of a paced file chunk
pub const CHUNK_TAG: &str = "FILE:";

/// Prefix of a single-shot whole-payload blob
pub const BLOB_TAG: &str = "FILEB:";

/// Private-use code point standing in for `\n` inside chunk and blob bodies
pub const NEWLINE_PLACEHOLDER: char = '\u{E000}';

/// A single unit written to the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// `CMD:<text>`; the text is everything after the tag
    Command(String),
    /// An untagged line the firmware relays over the light channel as-is
    Message(String),
    /// `FILE:<body>` for one chunk of a paced transfer
    Chunk(Vec<u8>),
    /// `FILEB:<body>` for a whole payload at once
    Blob(Vec<u8>),
}

impl OutboundFrame {
    /// Classify a line typed by a user: `CMD:` lines are commands, anything else a message
    pub fn from_input(text: &str) -> Self {
        match text.strip_prefix(COMMAND_TAG) {
            Some(rest) => OutboundFrame::Command(rest.to_string()),
            None => OutboundFrame::Message(text.to_string()),
        }
    }

    /// Serialize to the exact bytes put on the wire, including the trailing newline
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            OutboundFrame::Command(text) => {
                out.extend_from_slice(COMMAND_TAG.as_bytes());
                out.extend(single_line(text.as_bytes()));
            }
            OutboundFrame::Message(text) => {
                out.extend(single_line(text.as_bytes()));
            }
            OutboundFrame::Chunk(body) => {
                out.extend_from_slice(CHUNK_TAG.as_bytes());
                out.extend(escape_body(body));
            }
            OutboundFrame::Blob(body) => {
                out.extend_from_slice(BLOB_TAG.as_bytes());
                out.extend(escape_body(body));
            }
        }
        out.push(b'\n');
        out
    }

    /// Number of payload bytes carried (before escaping)
    pub fn payload_len(&self) -> usize {
        match self {
            OutboundFrame::Command(text) | OutboundFrame::Message(text) => text.len(),
            OutboundFrame::Chunk(body) | OutboundFrame::Blob(body) => body.len(),
        }
    }
}

impl fmt::Display for OutboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboundFrame::Command(text) => write!(f, "{}{}", COMMAND_TAG, text),
            OutboundFrame::Message(text) => write!(f, "{}", text),
            OutboundFrame::Chunk(body) => write!(f, "{}<{} bytes>", CHUNK_TAG, body.len()),
            OutboundFrame::Blob(body) => write!(f, "{}<{} bytes>", BLOB_TAG, body.len()),
        }
    }
}

/// Interactive lines cannot carry line breaks; cut at the first one
fn single_line(text: &[u8]) -> impl Iterator<Item = u8> + '_ {
    text.iter()
        .copied()
        .take_while(|&b| b != b'\n')
        .filter(|&b| b != b'\r')
}

/// Length of `body` after [`escape_body`]
pub fn escaped_len(body: &[u8]) -> usize {
    body.iter()
        .map(|&b| match b {
            b'\n' => NEWLINE_PLACEHOLDER.len_utf8(),
            b'\r' => 0,
            _ => 1,
        })
        .sum()
}

/// Bytes a `FILEB:` frame carrying `body` takes on the wire, terminator included
pub fn blob_wire_len(body: &[u8]) -> usize {
    BLOB_TAG.len() + escaped_len(body) + 1
}

/// Replace `\n` with the placeholder and strip `\r`
pub fn escape_body(body: &[u8]) -> Vec<u8> {
    let mut placeholder = [0u8; 4];
    let placeholder = NEWLINE_PLACEHOLDER.encode_utf8(&mut placeholder).as_bytes();

    let mut out = Vec::with_capacity(escaped_len(body));
    for &b in body {
        match b {
            b'\n' => out.extend_from_slice(placeholder),
            b'\r' => {}
            _ => out.push(b),
        }
    }
    out
}

/// Reverse of [`escape_body`] (carriage returns are not restored)
pub fn unescape_body(body: &[u8]) -> Vec<u8> {
    let mut placeholder = [0u8; 4];
    let placeholder = NEWLINE_PLACEHOLDER.encode_utf8(&mut placeholder).as_bytes();

    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if body[i..].starts_with(placeholder) {
            out.push(b'\n');
            i += placeholder.len();
        } else {
            out.push(body[i]);
            i += 1;
        }
    }
    out
}

/// A decoded line received from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// The firmware echoing a command back; dropped
    Echo,
    /// Status or log output to forward to clients
    Status(String),
}

impl InboundEvent {
    /// Decode one raw line; `None` when nothing is left after trimming
    pub fn decode(raw: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end();
        if line.is_empty() {
            return None;
        }
        if line.starts_with(COMMAND_TAG) {
            return Some(InboundEvent::Echo);
        }
        Some(InboundEvent::Status(line.to_string()))
    }
}

/// Longest unterminated line held back; anything longer is forwarded in pieces
pub const MAX_LINE_LEN: usize = 4096;

/// How long an unterminated line may sit before it is forwarded as-is
pub const PARTIAL_LINE_IDLE: Duration = Duration::from_secs(1);

/// Accumulates raw bytes and yields complete `\n`-terminated lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    last_input: Option<Instant>,
}

impl LineBuffer {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and drain every complete line (without the terminator).
    ///
    /// Always leaves fewer than [`MAX_LINE_LEN`] bytes pending: a longer run
    /// without a newline comes out in `MAX_LINE_LEN` pieces.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(bytes);
        self.last_input = Some(Instant::now());

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            lines.push(line);
        }
        if self.pending.len() >= MAX_LINE_LEN {
            let whole = self.pending.len() - self.pending.len() % MAX_LINE_LEN;
            let rest = self.pending.split_off(whole);
            lines.extend(self.pending.chunks(MAX_LINE_LEN).map(<[u8]>::to_vec));
            self.pending = rest;
        }
        lines
    }

    /// Take the unfinished line once no input has arrived for `idle`
    pub fn flush_idle(&mut self, idle: Duration) -> Option<Vec<u8>> {
        let quiet = self.last_input.is_some_and(|at| at.elapsed() >= idle);
        if quiet && !self.pending.is_empty() {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }

    /// Bytes of an unfinished line
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
