//! Turning a payload into the frames that carry it

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::frame::blob_wire_len;
use crate::protocol::OutboundFrame;

/// Device receive buffer available to one single-shot frame
pub const DEFAULT_BLOB_CEILING: usize = 8000;

/// Payload bytes per paced chunk
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Gap between paced frames; matches the optical link's reliable throughput
pub const DEFAULT_FRAME_DELAY_MS: u64 = 1500;

/// How a payload is put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// One `FILEB:` frame, truncated to the ceiling
    #[default]
    SingleShot,
    /// `FILE:` chunks separated by the frame delay
    Paced,
    /// Single-shot when the encoded frame fits under the ceiling, paced otherwise
    Auto,
}

/// Transfer engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Strategy selection
    pub mode: TransferMode,
    /// Largest single-shot frame the device can buffer, in bytes
    pub blob_ceiling: usize,
    /// Payload bytes per paced chunk
    pub chunk_size: usize,
    /// Gap between paced frames, in milliseconds
    pub frame_delay_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            mode: TransferMode::default(),
            blob_ceiling: DEFAULT_BLOB_CEILING,
            chunk_size: DEFAULT_CHUNK_SIZE,
            frame_delay_ms: DEFAULT_FRAME_DELAY_MS,
        }
    }
}

impl TransferConfig {
    /// [`Self::frame_delay_ms`] as a `Duration`
    pub fn frame_delay(&self) -> Duration {
        Duration::from_millis(self.frame_delay_ms)
    }
}

/// Strategy chosen for one payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One `FILEB:` frame
    SingleShot,
    /// `FILE:` chunks with a delay between them
    Paced,
}

/// The frames for one payload, in send order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    /// How the frames go out
    pub strategy: Strategy,
    /// Frames in send order
    pub frames: Vec<OutboundFrame>,
    /// Original size when the payload was cut to the ceiling
    pub truncated_from: Option<usize>,
}

impl TransferPlan {
    /// Pick a strategy and cut the payload into frames
    pub fn build(payload: &[u8], config: &TransferConfig) -> Self {
        let strategy = match config.mode {
            TransferMode::SingleShot => Strategy::SingleShot,
            TransferMode::Paced => Strategy::Paced,
            // escaping grows every newline, so measure the frame, not the payload
            TransferMode::Auto if blob_wire_len(payload) <= config.blob_ceiling => {
                Strategy::SingleShot
            }
            TransferMode::Auto => Strategy::Paced,
        };

        match strategy {
            Strategy::SingleShot => {
                let (body, truncated_from) = if payload.len() > config.blob_ceiling {
                    (&payload[..config.blob_ceiling], Some(payload.len()))
                } else {
                    (payload, None)
                };
                Self {
                    strategy,
                    frames: vec![OutboundFrame::Blob(body.to_vec())],
                    truncated_from,
                }
            }
            Strategy::Paced => Self {
                strategy,
                frames: paced_chunks(payload, config.chunk_size)
                    .into_iter()
                    .map(OutboundFrame::Chunk)
                    .collect(),
                truncated_from: None,
            },
        }
    }

    /// Payload bytes carried by all frames
    pub fn payload_len(&self) -> usize {
        self.frames.iter().map(OutboundFrame::payload_len).sum()
    }
}

/// Pack whole lines (terminators included) into chunks of at most `chunk_size`
/// bytes. A line longer than a chunk is split across several.
///
/// Concatenating the chunks gives back the payload exactly.
pub fn paced_chunks(payload: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current: Vec<u8> = Vec::with_capacity(chunk_size);

    for line in payload.split_inclusive(|&b| b == b'\n') {
        if !current.is_empty() && current.len() + line.len() > chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
        if line.len() > chunk_size {
            let mut pieces = line.chunks(chunk_size).peekable();
            while let Some(piece) = pieces.next() {
                if pieces.peek().is_some() {
                    chunks.push(piece.to_vec());
                } else {
                    current.extend_from_slice(piece);
                }
            }
        } else {
            current.extend_from_slice(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
