//! Serial link to the optical transmitter
//!
//! Line-oriented framing over a USB serial port: `CMD:` commands, `FILE:`
//! paced chunks and `FILEB:` single-shot blobs out; free-form status lines in.

mod error;
pub mod frame;
mod link;
pub mod reader;
pub mod serial;
pub mod stream;

pub use error::{LinkError, TransferError};
pub use frame::{InboundEvent, OutboundFrame};
pub use link::{LinkCounters, LinkHandle, LinkManager, LinkStatus};
pub use reader::{spawn_reader, ReaderConfig, ReaderHandle};
pub use serial::{list_ports, probe, PortInfo, PortOpener, SerialOpener};
pub use stream::{LinkChannel, SerialChannel};

/// Default baud rate. The transmitter is USB CDC and ignores it.
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Device paths tried in order when none are configured
pub const DEFAULT_CANDIDATES: [&str; 3] = ["/dev/ttyACM0", "/dev/ttyACM1", "/dev/ttyACM2"];

/// Pause between closing the old port and reopening on reconnect
pub const DEFAULT_SETTLE_MS: u64 = 500;
