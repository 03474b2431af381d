//! Link and transfer errors

use thiserror::Error;

/// Errors that can occur on the serial link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No candidate path opened
    #[error("Could not open any serial port from {candidates:?}")]
    PortUnavailable {
        /// Paths that were tried, in order
        candidates: Vec<String>,
    },

    /// No current link, or the handle in use was discarded
    #[error("Serial port not open")]
    LinkClosed,

    /// I/O failure on the port, with the underlying cause text
    #[error("Serial I/O error: {0}")]
    LinkIo(String),

    /// Payload over the single-frame ceiling
    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge {
        /// Payload size in bytes
        size: usize,
        /// Ceiling in bytes
        limit: usize,
    },

    /// The blocking write was cancelled before it ran
    #[error("Transfer cancelled")]
    Cancelled,
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::LinkIo(e.to_string())
    }
}

/// A blocking write task that never finished
impl From<tokio::task::JoinError> for LinkError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            LinkError::Cancelled
        } else {
            LinkError::LinkIo(e.to_string())
        }
    }
}

impl From<serialport::Error> for LinkError {
    fn from(e: serialport::Error) -> Self {
        LinkError::LinkIo(e.to_string())
    }
}

/// Errors that prevent a bulk transfer from starting
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Another session holds the engine
    #[error("A file transfer is already in progress")]
    Busy,

    /// The link refused the transfer
    #[error(transparent)]
    Link(#[from] LinkError),
}
