//! Background reader
//!
//! Drains status lines from whatever link is current and publishes them.
//! Runs on its own thread until its shutdown token is cancelled, and survives
//! every error: a link that disappears mid-read is simply skipped until the
//! manager installs a new one.

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::frame::InboundEvent;
use super::link::LinkManager;
use crate::events::{Event, EventSink};

/// Reader timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Sleep when no link is open
    pub idle_poll_ms: u64,
    /// Sleep when a link is open but no input is waiting
    pub input_poll_ms: u64,
    /// Sleep after an unexpected error
    pub error_backoff_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: 100,
            input_poll_ms: 10,
            error_backoff_ms: 1000,
        }
    }
}

/// What one poll iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Poll {
    /// No link is open
    NoLink,
    /// Link open, nothing complete to read
    Quiet,
    /// This many lines were forwarded
    Forwarded(usize),
    /// The link went away under us; nothing reported
    Dropped,
    /// Something other than a disconnect failed
    Fault,
}

/// Device-gone and timeout conditions; everything else is unexpected
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    ) || err.raw_os_error().is_some()
}

/// One iteration: snapshot the link, read, filter echoes, publish
pub(crate) fn poll_once(link: &LinkManager, sink: &dyn EventSink) -> Poll {
    let Some(handle) = link.current() else {
        return Poll::NoLink;
    };

    let lines = match handle.read_lines() {
        Ok(lines) => lines,
        Err(e) if is_transient(&e) => {
            tracing::debug!("read on {} abandoned: {}", handle.path(), e);
            return Poll::Dropped;
        }
        Err(e) => {
            tracing::warn!("Serial read error on {}: {}", handle.path(), e);
            return Poll::Fault;
        }
    };
    if lines.is_empty() {
        return Poll::Quiet;
    }

    let mut forwarded = 0;
    for raw in &lines {
        match InboundEvent::decode(raw) {
            Some(InboundEvent::Status(text)) => {
                tracing::debug!("[RX] {}", text);
                sink.broadcast(Event::LogMessage(text));
                forwarded += 1;
            }
            // the firmware echoes every command back
            Some(InboundEvent::Echo) | None => {}
        }
    }
    link.record_lines(lines.len());
    Poll::Forwarded(forwarded)
}

/// Owns the reader thread
pub struct ReaderHandle {
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    /// False once the thread has exited
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and wait for the thread to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("reader thread panicked");
            }
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the reader loop on a dedicated thread
pub fn spawn_reader(
    link: Arc<LinkManager>,
    sink: Arc<dyn EventSink>,
    config: ReaderConfig,
    shutdown: CancellationToken,
) -> io::Result<ReaderHandle> {
    let token = shutdown.clone();
    let thread = thread::Builder::new()
        .name("lifi-reader".into())
        .spawn(move || run(&link, sink.as_ref(), &config, &token))?;

    Ok(ReaderHandle {
        shutdown,
        thread: Some(thread),
    })
}

fn run(link: &LinkManager, sink: &dyn EventSink, config: &ReaderConfig, shutdown: &CancellationToken) {
    tracing::debug!("reader started");
    while !shutdown.is_cancelled() {
        let pause = match poll_once(link, sink) {
            Poll::NoLink => config.idle_poll_ms,
            Poll::Quiet | Poll::Dropped => config.input_poll_ms,
            Poll::Forwarded(n) => {
                tracing::trace!("forwarded {} lines", n);
                0
            }
            Poll::Fault => config.error_backoff_ms,
        };
        if pause > 0 {
            thread::sleep(Duration::from_millis(pause));
        }
    }
    tracing::debug!("reader stopped");
}
