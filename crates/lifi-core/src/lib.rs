//! # Li-Fi Bridge Core Library
//!
//! Host side of the link between a web dashboard and an optical transmitter.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Ownership of the single serial link, with serialized writes and atomic reconnect
//! - A background reader republishing device status lines
//! - Single-shot and paced bulk file transfer with cooperative cancellation
//! - Request routing from dashboard clients and event fan-out back to them
//!
//! ## Example
//!
//! ```rust,ignore
//! use lifi_core::prelude::*;
//! use std::sync::Arc;
//!
//! let link = Arc::new(LinkManager::new(Box::new(SerialOpener), config.link.settle()));
//! link.open(&config.link.candidates, config.link.baud_rate)?;
//!
//! let engine = Arc::new(TransferEngine::new(link.clone(), sink.clone(), config.transfer));
//! let outcome = engine.send(client, b"hello over light").await?;
//! ```

pub mod config;
pub mod dispatch;
pub mod events;
pub mod protocol;
pub mod transfer;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{BridgeConfig, LinkSettings};
    pub use crate::dispatch::{BridgeContext, Dispatcher, Request};
    pub use crate::events::{BroadcastSink, ClientId, Event, EventSink, Subscription};
    pub use crate::protocol::{
        spawn_reader, LinkError, LinkManager, LinkStatus, OutboundFrame, ReaderHandle,
        SerialOpener, TransferError,
    };
    pub use crate::transfer::{TransferEngine, TransferMode, TransferOutcome};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
