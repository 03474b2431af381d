//! Bridge configuration stored as JSON
//!
//! Every field is optional in the file; anything missing takes its default.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::protocol::{ReaderConfig, DEFAULT_BAUD_RATE, DEFAULT_CANDIDATES, DEFAULT_SETTLE_MS};
use crate::transfer::TransferConfig;

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Device paths tried in order; empty means "discover"
    pub candidates: Vec<String>,

    /// Baud rate (advisory for USB CDC devices)
    pub baud_rate: u32,

    /// Pause between closing and reopening on reconnect, in milliseconds
    pub settle_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            candidates: DEFAULT_CANDIDATES.iter().map(|s| s.to_string()).collect(),
            baud_rate: DEFAULT_BAUD_RATE,
            settle_ms: DEFAULT_SETTLE_MS,
        }
    }
}

impl LinkSettings {
    /// [`Self::settle_ms`] as a `Duration`
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Everything the bridge needs to start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Serial port selection
    pub link: LinkSettings,
    /// Bulk transfer behavior
    pub transfer: TransferConfig,
    /// Reader loop timing
    pub reader: ReaderConfig,
}

impl BridgeConfig {
    /// Load from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Write as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }
}
