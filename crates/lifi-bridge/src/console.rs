//! Local console client
//!
//! Attaches stdin/stdout to the dispatcher as one more dashboard client. Plain
//! lines go out as commands or messages, `/` lines are console actions, and a
//! line starting with `{` is taken as a JSON request.

use anyhow::{Context, Result};
use lifi_core::dispatch::{Dispatcher, Request};
use lifi_core::events::{BroadcastSink, ClientId, Event};
use lifi_core::protocol::{list_ports, LinkStatus};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const HELP: &str = "\
  <text>            send a line (prefix with CMD: for device commands)
  /send <file>      upload a text file
  /stop             stop the running upload
  /reconnect        reopen the serial port
  /ports            list serial ports
  /status           show link state and counters
  /quit             exit";

/// One parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Request(Request),
    SendFile(PathBuf),
    ListPorts,
    Status,
    Help,
    Quit,
}

pub fn parse_line(line: &str) -> Result<Option<ConsoleInput>, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    if line.starts_with('{') {
        return serde_json::from_str(line)
            .map(|req| Some(ConsoleInput::Request(req)))
            .map_err(|e| format!("invalid request: {}", e));
    }
    let Some(action) = line.strip_prefix('/') else {
        return Ok(Some(ConsoleInput::Request(Request::SendCommand {
            data: line.to_string(),
        })));
    };

    let (name, arg) = match action.split_once(' ') {
        Some((name, arg)) => (name, arg.trim()),
        None => (action, ""),
    };
    let input = match name {
        "send" if !arg.is_empty() => ConsoleInput::SendFile(PathBuf::from(arg)),
        "send" => return Err("usage: /send <file>".to_string()),
        "stop" => ConsoleInput::Request(Request::StopTransfer),
        "reconnect" => ConsoleInput::Request(Request::Reconnect),
        "ports" => ConsoleInput::ListPorts,
        "status" => ConsoleInput::Status,
        "help" => ConsoleInput::Help,
        "quit" | "exit" => ConsoleInput::Quit,
        other => return Err(format!("unknown action /{} (try /help)", other)),
    };
    Ok(Some(input))
}

fn print_event(event: &Event) {
    match event {
        Event::LogMessage(text) => println!("{}", text),
        Event::LinkStatus(LinkStatus::Open { path }) => println!("[link] open on {}", path),
        Event::LinkStatus(LinkStatus::Closed { .. }) => println!("[link] closed"),
    }
}

/// Read lines on a plain thread so a pending stdin read never holds up
/// runtime shutdown. The channel closes at EOF.
fn spawn_line_reader<R, F>(open: F) -> io::Result<mpsc::Receiver<io::Result<String>>>
where
    F: FnOnce() -> R + Send + 'static,
    R: BufRead,
{
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new()
        .name("lifi-console".into())
        .spawn(move || {
            for line in open().lines() {
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

fn print_status(dispatcher: &Dispatcher) {
    let ctx = dispatcher.context();
    let counters = ctx.link.counters();
    match ctx.link.current() {
        Some(handle) => println!(
            "open on {} since {}",
            handle.path(),
            handle.opened_at().format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!("{:?}", ctx.link.status()),
    }
    println!(
        "{} frames / {} bytes out, {} lines in",
        counters.frames_written, counters.bytes_written, counters.lines_read
    );
    if let Some(progress) = ctx.engine.progress() {
        println!(
            "upload: {}/{} frames, {}/{} bytes since {}",
            progress.frames_sent,
            progress.total_frames,
            progress.bytes_sent,
            progress.total_bytes,
            progress.started_at.format("%H:%M:%S")
        );
    }
}

async fn read_upload(path: &Path) -> Result<Request> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());
    Ok(Request::SendBulk { filename, data })
}

/// Serve the console until EOF, `/quit` or shutdown
pub async fn run(
    dispatcher: Dispatcher,
    sink: &BroadcastSink,
    shutdown: CancellationToken,
) -> Result<()> {
    let client = ClientId::new();
    let mut events = sink.subscribe(client);
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    dispatcher.client_connected(client);
    let mut lines = spawn_line_reader(|| io::stdin().lock()).context("spawning stdin reader")?;

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.context("reading stdin")?;

        let input = match parse_line(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };

        match input {
            ConsoleInput::Request(request) => dispatcher.dispatch(client, request).await,
            ConsoleInput::SendFile(path) => match read_upload(&path).await {
                Ok(request) => dispatcher.dispatch(client, request).await,
                Err(e) => eprintln!("{:#}", e),
            },
            ConsoleInput::ListPorts => {
                for port in list_ports() {
                    println!("{}  {}", port.name, port.product.unwrap_or_default());
                }
            }
            ConsoleInput::Status => print_status(&dispatcher),
            ConsoleInput::Help => println!("{}", HELP),
            ConsoleInput::Quit => break,
        }
    }

    printer.abort();
    Ok(())
}
