//! Link management
//!
//! Owns the single serial connection. Writes, close and reconnect are
//! serialized on one mutex; reads go through a separate channel handle so the
//! reader loop never waits on a writer. The reconnect settle pause runs with
//! the mutex released and no link installed, so writes during it fail fast.
//!
//! Replacing the connection always clears the current handle before closing
//! it, so anything still holding the old handle sees it closed and fails with
//! [`LinkError::LinkClosed`] instead of writing to a port that is going away.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use super::frame::{LineBuffer, OutboundFrame, PARTIAL_LINE_IDLE};
use super::serial::{probe, PortOpener};
use super::stream::LinkChannel;
use super::LinkError;

/// Largest single read taken from the device per poll
const READ_CHUNK: usize = 1024;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether a link is open, as reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkStatus {
    /// A port is open
    Open {
        /// Device path
        path: String,
    },
    /// No port is open
    Closed {
        /// Last port that was open or tried, if any
        path: Option<String>,
    },
}

struct ReadSide {
    channel: Box<dyn LinkChannel>,
    lines: LineBuffer,
}

/// One open serial connection
pub struct LinkHandle {
    path: String,
    opened_at: DateTime<Utc>,
    closed: AtomicBool,
    writer: Mutex<Option<Box<dyn LinkChannel>>>,
    reader: Mutex<Option<ReadSide>>,
}

impl LinkHandle {
    fn new(path: String, mut channel: Box<dyn LinkChannel>) -> Result<Self, LinkError> {
        // Stale boot output from before we opened is not interesting
        if let Err(e) = channel.clear_input() {
            tracing::debug!("{}: could not clear input buffer: {}", path, e);
        }
        let read_channel = channel.try_clone()?;

        Ok(Self {
            path,
            opened_at: Utc::now(),
            closed: AtomicBool::new(false),
            writer: Mutex::new(Some(channel)),
            reader: Mutex::new(Some(ReadSide {
                channel: read_channel,
                lines: LineBuffer::new(),
            })),
        })
    }

    /// Device path this handle was opened on
    pub fn path(&self) -> &str {
        &self.path
    }

    /// When the port was opened
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// False once the manager has discarded this handle
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Read whatever input is waiting and return the complete lines it finished.
    ///
    /// Never blocks on an idle device. An unterminated line is returned as-is
    /// once the device has been quiet for [`PARTIAL_LINE_IDLE`].
    pub fn read_lines(&self) -> io::Result<Vec<Vec<u8>>> {
        let mut guard = lock(&self.reader);
        let side = match guard.as_mut() {
            Some(side) if self.is_open() => side,
            _ => return Err(io::Error::new(io::ErrorKind::NotConnected, "link closed")),
        };

        let available = side.channel.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(side.lines.flush_idle(PARTIAL_LINE_IDLE).into_iter().collect());
        }

        let mut buf = [0u8; READ_CHUNK];
        let to_read = available.min(buf.len());
        let n = match side.channel.read(&mut buf[..to_read]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
            Err(e) => return Err(e),
        };
        Ok(side.lines.push(&buf[..n]))
    }

    fn write_all(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut guard = lock(&self.writer);
        let channel = match guard.as_mut() {
            Some(channel) if self.is_open() => channel,
            _ => return Err(LinkError::LinkClosed),
        };
        channel.write_all(bytes)?;
        channel.flush()?;
        Ok(())
    }

    /// Mark closed and drop both directions; the port closes with the last channel
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        lock(&self.writer).take();
        lock(&self.reader).take();
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Snapshot of traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCounters {
    /// Frames put on the wire
    pub frames_written: u64,
    /// Encoded bytes put on the wire, terminators included
    pub bytes_written: u64,
    /// Raw lines taken off the wire, echoes and blanks included
    pub lines_read: u64,
}

/// Owner of the serial link
pub struct LinkManager {
    opener: Box<dyn PortOpener>,
    /// Pause between closing the old port and probing again
    settle: Duration,
    current: RwLock<Option<Arc<LinkHandle>>>,
    /// Serializes write, close, open and reconnect
    op_lock: Mutex<()>,
    last_path: RwLock<Option<String>>,
    frames_written: AtomicU64,
    bytes_written: AtomicU64,
    lines_read: AtomicU64,
}

impl LinkManager {
    /// Manager with no link open; `settle` is the reconnect pause
    pub fn new(opener: Box<dyn PortOpener>, settle: Duration) -> Self {
        Self {
            opener,
            settle,
            current: RwLock::new(None),
            op_lock: Mutex::new(()),
            last_path: RwLock::new(None),
            frames_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            lines_read: AtomicU64::new(0),
        }
    }

    /// Snapshot of the current handle.
    ///
    /// Advisory only: the handle may be discarded right after this returns, in
    /// which case writes through it fail with `LinkClosed`.
    pub fn current(&self) -> Option<Arc<LinkHandle>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a link is installed right now
    pub fn is_open(&self) -> bool {
        self.current().is_some()
    }

    /// Path of the open port, if any
    pub fn port_name(&self) -> Option<String> {
        self.current().map(|h| h.path().to_string())
    }

    /// Open/closed state as reported to clients
    pub fn status(&self) -> LinkStatus {
        match self.current() {
            Some(handle) => LinkStatus::Open {
                path: handle.path().to_string(),
            },
            None => LinkStatus::Closed {
                path: self
                    .last_path
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
            },
        }
    }

    /// Traffic totals since the manager was created
    pub fn counters(&self) -> LinkCounters {
        LinkCounters {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            lines_read: self.lines_read.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_lines(&self, count: usize) {
        self.lines_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Open the first candidate that works. Replaces any link already open.
    pub fn open(&self, candidates: &[String], baud_rate: u32) -> Result<String, LinkError> {
        let _guard = lock(&self.op_lock);
        self.clear_locked();
        self.open_locked(candidates, baud_rate)
    }

    /// Write one frame to the current link.
    ///
    /// The handle is taken before waiting for the mutex, so a write that
    /// starts before a reconnect lands on the old port or fails.
    pub fn write_frame(&self, frame: &OutboundFrame) -> Result<(), LinkError> {
        let handle = self.current().ok_or(LinkError::LinkClosed)?;
        self.write_frame_on(&handle, frame)
    }

    /// Write one frame through a handle captured earlier.
    ///
    /// Fails with `LinkClosed` if the link was closed or replaced since the
    /// handle was taken, so a multi-frame transfer never continues on a new port.
    pub fn write_frame_on(&self, handle: &LinkHandle, frame: &OutboundFrame) -> Result<(), LinkError> {
        let _guard = lock(&self.op_lock);
        if !handle.is_open() {
            return Err(LinkError::LinkClosed);
        }
        self.write_locked(handle, frame)
    }

    /// Drop the current link and probe the candidates again.
    ///
    /// The settle pause happens with no link installed and the mutex free.
    pub fn reconnect(&self, candidates: &[String], baud_rate: u32) -> Result<String, LinkError> {
        {
            let _guard = lock(&self.op_lock);
            self.clear_locked();
        }
        std::thread::sleep(self.settle);

        let _guard = lock(&self.op_lock);
        // something may have opened during the pause
        self.clear_locked();
        self.open_locked(candidates, baud_rate)
    }

    /// Close the link. Calling it with nothing open is a no-op.
    pub fn close(&self) {
        let _guard = lock(&self.op_lock);
        self.clear_locked();
    }

    fn write_locked(&self, handle: &LinkHandle, frame: &OutboundFrame) -> Result<(), LinkError> {
        let bytes = frame.encode();
        handle.write_all(&bytes)?;
        tracing::debug!("[TX] {} ({} bytes on {})", frame, bytes.len(), handle.path());
        self.frames_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Unpublish first, then close: readers and pinned writers see "no link"
    /// before the port is torn down. Caller holds `op_lock`.
    fn clear_locked(&self) {
        let old = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(old) = old {
            old.close();
            tracing::info!("Closed {}", old.path());
        }
    }

    /// Caller holds `op_lock`
    fn open_locked(&self, candidates: &[String], baud_rate: u32) -> Result<String, LinkError> {
        let (path, channel) = match probe(self.opener.as_ref(), candidates, baud_rate) {
            Ok(found) => found,
            Err(e) => {
                if let Some(first) = candidates.first() {
                    let mut last = self.last_path.write().unwrap_or_else(PoisonError::into_inner);
                    last.get_or_insert_with(|| first.clone());
                }
                tracing::warn!("{}", e);
                return Err(e);
            }
        };

        let handle = Arc::new(LinkHandle::new(path.clone(), channel)?);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        *self.last_path.write().unwrap_or_else(PoisonError::into_inner) = Some(path.clone());
        tracing::info!("Connected to {} at {} baud", path, baud_rate);
        Ok(path)
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        self.clear_locked();
    }
}
