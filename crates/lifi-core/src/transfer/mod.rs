//! Bulk transfer engine
//!
//! Sends a file to the transmitter either as one escaped `FILEB:` frame or as
//! paced `FILE:` chunks. Only one session runs at a time; a second request is
//! refused with [`TransferError::Busy`] rather than interleaved on the wire.
//!
//! Delivery is best effort. Cancelling stops before the next frame and leaves
//! whatever already went out on the device.

mod plan;

pub use plan::{
    paced_chunks, Strategy, TransferConfig, TransferMode, TransferPlan, DEFAULT_BLOB_CEILING,
    DEFAULT_CHUNK_SIZE, DEFAULT_FRAME_DELAY_MS,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use crate::events::{ClientId, Event, EventSink};
use crate::protocol::{LinkError, LinkManager, TransferError};

/// How a transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Empty payload; nothing was sent
    Skipped,
    /// Every frame went out
    Completed {
        /// Payload bytes written
        bytes_sent: usize,
        /// Frames written
        frames: usize,
    },
    /// Stopped on request; the device holds a partial payload
    Cancelled {
        /// Payload bytes written before the stop
        bytes_sent: usize,
        /// Frames written before the stop
        frames: usize,
    },
    /// The link failed mid-transfer
    Failed {
        /// What went wrong
        reason: LinkError,
        /// Payload bytes written before the failure
        bytes_sent: usize,
        /// Frames written before the failure
        frames: usize,
    },
}

/// Snapshot of the running session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    /// Client that started the upload
    pub client: ClientId,
    /// Single-shot or paced
    pub strategy: Strategy,
    /// Payload bytes the plan carries
    pub total_bytes: usize,
    /// Frames in the plan
    pub total_frames: usize,
    /// Payload bytes written so far
    pub bytes_sent: usize,
    /// Frames written so far
    pub frames_sent: usize,
    /// When the session was claimed
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    bytes: AtomicUsize,
    frames: AtomicUsize,
}

struct ActiveSession {
    id: u64,
    client: ClientId,
    strategy: Strategy,
    total_bytes: usize,
    total_frames: usize,
    started_at: DateTime<Utc>,
    token: CancellationToken,
    counters: Arc<Counters>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs at most one bulk transfer at a time over the shared link
pub struct TransferEngine {
    link: Arc<LinkManager>,
    sink: Arc<dyn EventSink>,
    config: TransferConfig,
    active: Mutex<Option<ActiveSession>>,
    next_id: AtomicU64,
}

impl TransferEngine {
    /// Idle engine writing through `link` and reporting to `sink`
    pub fn new(link: Arc<LinkManager>, sink: Arc<dyn EventSink>, config: TransferConfig) -> Self {
        Self {
            link,
            sink,
            config,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Settings in effect
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Whether a session currently holds the engine
    pub fn is_active(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Snapshot of the running session, if any
    pub fn progress(&self) -> Option<TransferProgress> {
        lock(&self.active).as_ref().map(|s| TransferProgress {
            client: s.client,
            strategy: s.strategy,
            total_bytes: s.total_bytes,
            total_frames: s.total_frames,
            bytes_sent: s.counters.bytes.load(Ordering::Relaxed),
            frames_sent: s.counters.frames.load(Ordering::Relaxed),
            started_at: s.started_at,
        })
    }

    /// Ask the running session to stop. Returns false when nothing is running.
    pub fn cancel(&self) -> bool {
        match lock(&self.active).as_ref() {
            Some(session) => {
                session.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Claim the engine for a new session.
    ///
    /// `Ok(None)` for an empty payload, which sends nothing.
    pub fn begin(
        self: &Arc<Self>,
        client: ClientId,
        payload: &[u8],
    ) -> Result<Option<TransferSession>, TransferError> {
        if payload.is_empty() {
            return Ok(None);
        }

        let mut active = lock(&self.active);
        if active.is_some() {
            return Err(TransferError::Busy);
        }

        let plan = TransferPlan::build(payload, &self.config);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        *active = Some(ActiveSession {
            id,
            client,
            strategy: plan.strategy,
            total_bytes: plan.payload_len(),
            total_frames: plan.frames.len(),
            started_at: Utc::now(),
            token: token.clone(),
            counters: counters.clone(),
        });
        drop(active);

        Ok(Some(TransferSession {
            engine: self.clone(),
            id,
            client,
            plan,
            token,
            counters,
        }))
    }

    /// Begin and run a session to its end
    pub async fn send(
        self: &Arc<Self>,
        client: ClientId,
        payload: &[u8],
    ) -> Result<TransferOutcome, TransferError> {
        match self.begin(client, payload)? {
            Some(session) => Ok(session.run().await),
            None => Ok(TransferOutcome::Skipped),
        }
    }

    fn finish(&self, id: u64) {
        let mut active = lock(&self.active);
        if active.as_ref().is_some_and(|s| s.id == id) {
            *active = None;
        }
    }
}

/// A claimed transfer. Dropping it, finished or not, frees the engine.
pub struct TransferSession {
    engine: Arc<TransferEngine>,
    id: u64,
    client: ClientId,
    plan: TransferPlan,
    token: CancellationToken,
    counters: Arc<Counters>,
}

impl TransferSession {
    /// Frames this session will send
    pub fn plan(&self) -> &TransferPlan {
        &self.plan
    }

    /// Token that stops this session when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Put every frame on the wire in order, honouring pacing and cancellation
    pub async fn run(self) -> TransferOutcome {
        let engine = self.engine.clone();
        let sink = engine.sink.as_ref();
        let total = self.plan.frames.len();

        if let Some(original) = self.plan.truncated_from {
            let err = LinkError::PayloadTooLarge {
                size: original,
                limit: engine.config.blob_ceiling,
            };
            tracing::warn!("{}; truncating", err);
            sink.reply(
                self.client,
                Event::log(format!(
                    "Warning: {}; only the first {} bytes will be sent",
                    err, engine.config.blob_ceiling
                )),
            );
        }
        if self.plan.strategy == Strategy::Paced {
            sink.reply(
                self.client,
                Event::log(format!("Splitting into {} chunks for reliability...", total)),
            );
        }

        // Pinned for the whole session: a reconnect fails the transfer instead
        // of continuing it on a different port
        let Some(handle) = engine.link.current() else {
            return self.outcome_failed(LinkError::LinkClosed);
        };

        let delay = engine.config.frame_delay();
        for (index, frame) in self.plan.frames.iter().enumerate() {
            if index > 0 && self.plan.strategy == Strategy::Paced {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if self.token.is_cancelled() {
                tracing::info!("transfer cancelled after {} of {} frames", index, total);
                return TransferOutcome::Cancelled {
                    bytes_sent: self.counters.bytes.load(Ordering::Relaxed),
                    frames: index,
                };
            }

            let link = engine.link.clone();
            let pinned = handle.clone();
            let frame = frame.clone();
            let len = frame.payload_len();
            let written = tokio::task::spawn_blocking(move || link.write_frame_on(&pinned, &frame))
                .await
                .unwrap_or_else(|e| Err(LinkError::from(e)));

            if let Err(reason) = written {
                tracing::warn!("transfer failed at frame {} of {}: {}", index + 1, total, reason);
                return self.outcome_failed(reason);
            }
            self.counters.bytes.fetch_add(len, Ordering::Relaxed);
            self.counters.frames.fetch_add(1, Ordering::Relaxed);
        }

        TransferOutcome::Completed {
            bytes_sent: self.counters.bytes.load(Ordering::Relaxed),
            frames: self.counters.frames.load(Ordering::Relaxed),
        }
    }

    fn outcome_failed(&self, reason: LinkError) -> TransferOutcome {
        TransferOutcome::Failed {
            reason,
            bytes_sent: self.counters.bytes.load(Ordering::Relaxed),
            frames: self.counters.frames.load(Ordering::Relaxed),
        }
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.engine.finish(self.id);
    }
}
