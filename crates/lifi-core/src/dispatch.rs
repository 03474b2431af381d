//! Client request routing
//!
//! Each request kind maps to one handler in [`ROUTES`]. Handlers get the link,
//! the transfer engine and the event sink through [`BridgeContext`]; nothing is
//! looked up globally.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::LinkSettings;
use crate::events::{ClientId, Event, EventSink};
use crate::protocol::{LinkError, LinkManager, LinkStatus, OutboundFrame, TransferError};
use crate::transfer::{TransferEngine, TransferOutcome};

/// A request from a dashboard client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Request {
    /// A command (`CMD:...`) or a message to relay over light
    SendCommand {
        /// Line as typed
        data: String,
    },
    /// Upload a text file
    #[serde(alias = "send_bulk_text")]
    SendBulk {
        /// Name shown in progress messages
        #[serde(default)]
        filename: Option<String>,
        /// File contents
        data: String,
    },
    /// Stop the running upload
    #[serde(alias = "stop_file_transfer")]
    StopTransfer,
    /// Reopen the serial port
    #[serde(alias = "reconnect_serial")]
    Reconnect,
}

/// Routing key of a [`Request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// [`Request::SendCommand`]
    SendCommand,
    /// [`Request::SendBulk`]
    SendBulk,
    /// [`Request::StopTransfer`]
    StopTransfer,
    /// [`Request::Reconnect`]
    Reconnect,
}

impl Request {
    /// Routing key
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::SendCommand { .. } => RequestKind::SendCommand,
            Request::SendBulk { .. } => RequestKind::SendBulk,
            Request::StopTransfer => RequestKind::StopTransfer,
            Request::Reconnect => RequestKind::Reconnect,
        }
    }
}

/// Everything a handler may touch
#[derive(Clone)]
pub struct BridgeContext {
    /// The serial link
    pub link: Arc<LinkManager>,
    /// Bulk transfer engine on that link
    pub engine: Arc<TransferEngine>,
    /// Where client events go
    pub sink: Arc<dyn EventSink>,
    /// Candidates and baud rate used on reconnect
    pub settings: LinkSettings,
}

type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
type Handler = for<'a> fn(&'a BridgeContext, ClientId, Request) -> BoxFuture<'a>;

/// Request kind to handler
pub const ROUTES: &[(RequestKind, Handler)] = &[
    (RequestKind::SendCommand, route_send_command),
    (RequestKind::SendBulk, route_send_bulk),
    (RequestKind::StopTransfer, route_stop_transfer),
    (RequestKind::Reconnect, route_reconnect),
];

fn route_send_command(ctx: &BridgeContext, client: ClientId, request: Request) -> BoxFuture<'_> {
    Box::pin(handle_send_command(ctx, client, request))
}

fn route_send_bulk(ctx: &BridgeContext, client: ClientId, request: Request) -> BoxFuture<'_> {
    Box::pin(handle_send_bulk(ctx, client, request))
}

fn route_stop_transfer(ctx: &BridgeContext, client: ClientId, request: Request) -> BoxFuture<'_> {
    Box::pin(handle_stop_transfer(ctx, client, request))
}

fn route_reconnect(ctx: &BridgeContext, client: ClientId, request: Request) -> BoxFuture<'_> {
    Box::pin(handle_reconnect(ctx, client, request))
}

/// Routes client requests to their handlers
#[derive(Clone)]
pub struct Dispatcher {
    ctx: BridgeContext,
}

impl Dispatcher {
    /// Router over `ctx`
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }

    /// Shared state the handlers use
    pub fn context(&self) -> &BridgeContext {
        &self.ctx
    }

    /// Greet a newly connected client with the current link state
    pub fn client_connected(&self, client: ClientId) {
        let sink = self.ctx.sink.as_ref();
        sink.reply(client, Event::log("Connected to Web Dashboard"));
        let status = self.ctx.link.status();
        let line = match &status {
            LinkStatus::Open { path } => format!("Serial Port {} OPEN", path),
            LinkStatus::Closed { path } => format!(
                "Serial Port {} closed or unavailable",
                path.as_deref().unwrap_or_else(|| self.first_candidate())
            ),
        };
        sink.reply(client, Event::log(line));
        sink.reply(client, Event::LinkStatus(status));
    }

    /// Run the handler registered for this request's kind
    pub async fn dispatch(&self, client: ClientId, request: Request) {
        let kind = request.kind();
        match ROUTES.iter().find(|(k, _)| *k == kind) {
            Some((_, handler)) => handler(&self.ctx, client, request).await,
            None => tracing::warn!("no handler for {:?}", kind),
        }
    }

    fn first_candidate(&self) -> &str {
        self.ctx
            .settings
            .candidates
            .first()
            .map(String::as_str)
            .unwrap_or("(none)")
    }
}

async fn handle_send_command(ctx: &BridgeContext, client: ClientId, request: Request) {
    let Request::SendCommand { data } = request else {
        return;
    };
    if data.is_empty() {
        return;
    }
    tracing::info!("[TX] {}", data);

    let link = ctx.link.clone();
    let frame = OutboundFrame::from_input(&data);
    let written = tokio::task::spawn_blocking(move || link.write_frame(&frame))
        .await
        .unwrap_or_else(|e| Err(LinkError::from(e)));

    match written {
        Ok(()) => ctx.sink.broadcast(Event::log(format!("> {}", data))),
        Err(LinkError::LinkClosed) => {
            ctx.sink.reply(client, Event::log("Error: Serial port not open"))
        }
        Err(e) => {
            tracing::warn!("Serial write error: {}", e);
            ctx.sink
                .reply(client, Event::log(format!("Error sending command: {}", e)));
        }
    }
}

async fn handle_send_bulk(ctx: &BridgeContext, client: ClientId, request: Request) {
    let Request::SendBulk { filename, data } = request else {
        return;
    };
    if data.is_empty() {
        return;
    }
    let filename = filename.unwrap_or_else(|| "unknown.txt".to_string());

    let session = match ctx.engine.begin(client, data.as_bytes()) {
        Ok(Some(session)) => session,
        Ok(None) => return,
        Err(TransferError::Busy) => {
            ctx.sink.reply(
                client,
                Event::log("Error: a file transfer is already in progress"),
            );
            return;
        }
        Err(e) => {
            ctx.sink
                .reply(client, Event::log(format!("Error during transmission: {}", e)));
            return;
        }
    };

    ctx.sink.reply(
        client,
        Event::log(format!(
            "Starting file upload: {} ({} lines, {} bytes)",
            filename,
            data.lines().count(),
            data.len()
        )),
    );

    // Runs on its own task so stop requests are handled while it paces
    let sink = ctx.sink.clone();
    let total = session.plan().frames.len();
    tokio::spawn(async move {
        let message = match session.run().await {
            TransferOutcome::Skipped => return,
            TransferOutcome::Completed { bytes_sent, frames } if frames == 1 => {
                format!("✓ File sent as a single frame ({} bytes)", bytes_sent)
            }
            TransferOutcome::Completed { frames, .. } => {
                format!("✓ File sent in {} chunks", frames)
            }
            TransferOutcome::Cancelled { frames, .. } => {
                format!("Transmission stopped after {} of {} chunks", frames, total)
            }
            TransferOutcome::Failed { reason, .. } => {
                format!("Error during transmission: {}", reason)
            }
        };
        sink.reply(client, Event::log(message));
    });
}

async fn handle_stop_transfer(ctx: &BridgeContext, client: ClientId, _request: Request) {
    if ctx.engine.cancel() {
        ctx.sink.reply(client, Event::log("Stopping transmission..."));
    }
}

async fn handle_reconnect(ctx: &BridgeContext, _client: ClientId, _request: Request) {
    let link = ctx.link.clone();
    let settings = ctx.settings.clone();
    let reopened = tokio::task::spawn_blocking(move || {
        link.reconnect(&settings.candidates, settings.baud_rate)
    })
    .await
    .unwrap_or_else(|e| Err(LinkError::from(e)));

    match reopened {
        Ok(path) => ctx
            .sink
            .broadcast(Event::log(format!("Reconnected to {}", path))),
        Err(e) => ctx
            .sink
            .broadcast(Event::log(format!("Failed to connect: {}", e))),
    }
    ctx.sink.broadcast(Event::LinkStatus(ctx.link.status()));
}
