mod common;

use common::{candidates, MockBench, MockDevice};
use lifi_core::config::LinkSettings;
use lifi_core::dispatch::{BridgeContext, Dispatcher, Request};
use lifi_core::events::{BroadcastSink, ClientId, Event, EventSink, Subscription};
use lifi_core::protocol::LinkStatus;
use lifi_core::transfer::{TransferConfig, TransferEngine, TransferMode};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

struct Bridge {
    bench: MockBench,
    device: MockDevice,
    sink: Arc<BroadcastSink>,
    dispatcher: Dispatcher,
}

fn bridge(transfer: TransferConfig) -> Bridge {
    let bench = MockBench::new();
    let device = bench.plug("/dev/ttyACM0");
    let link = bench.link();
    link.open(&candidates(), 115200).unwrap();

    let sink = Arc::new(BroadcastSink::new(64));
    let dyn_sink: Arc<dyn EventSink> = sink.clone();
    let engine = Arc::new(TransferEngine::new(link.clone(), dyn_sink.clone(), transfer));
    let dispatcher = Dispatcher::new(BridgeContext {
        link,
        engine,
        sink: dyn_sink,
        settings: LinkSettings {
            candidates: candidates(),
            settle_ms: 0,
            ..LinkSettings::default()
        },
    });
    Bridge {
        bench,
        device,
        sink,
        dispatcher,
    }
}

async fn next_log(sub: &mut Subscription) -> String {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("sink closed");
        if let Event::LogMessage(text) = event {
            return text;
        }
    }
}

#[tokio::test]
async fn test_new_client_gets_link_status() {
    let b = bridge(TransferConfig::default());
    let client = ClientId::new();
    let mut sub = b.sink.subscribe(client);

    b.dispatcher.client_connected(client);
    assert_eq!(next_log(&mut sub).await, "Connected to Web Dashboard");
    assert_eq!(next_log(&mut sub).await, "Serial Port /dev/ttyACM0 OPEN");

    b.dispatcher.context().link.close();
    b.dispatcher.client_connected(client);
    assert_eq!(next_log(&mut sub).await, "Connected to Web Dashboard");
    assert_eq!(
        next_log(&mut sub).await,
        "Serial Port /dev/ttyACM0 closed or unavailable"
    );
}

#[tokio::test]
async fn test_command_is_written_and_acknowledged_to_everyone() {
    let b = bridge(TransferConfig::default());
    let sender = ClientId::new();
    let mut other = b.sink.subscribe(ClientId::new());

    b.dispatcher
        .dispatch(
            sender,
            Request::SendCommand {
                data: "CMD: slot status".into(),
            },
        )
        .await;

    assert_eq!(b.device.written(), b"CMD: slot status\n");
    assert_eq!(next_log(&mut other).await, "> CMD: slot status");
}

#[tokio::test]
async fn test_command_without_link_errors_to_sender_only() {
    let b = bridge(TransferConfig::default());
    b.dispatcher.context().link.close();

    let sender = ClientId::new();
    let mut sender_sub = b.sink.subscribe(sender);
    let mut other = b.sink.subscribe(ClientId::new());

    b.dispatcher
        .dispatch(
            sender,
            Request::SendCommand {
                data: "STATUS".into(),
            },
        )
        .await;

    assert_eq!(next_log(&mut sender_sub).await, "Error: Serial port not open");
    assert_eq!(other.try_recv(), None);
    assert!(b.device.written().is_empty());
}

#[tokio::test]
async fn test_bulk_upload_reports_start_and_finish() {
    let b = bridge(TransferConfig::default());
    let client = ClientId::new();
    let mut sub = b.sink.subscribe(client);

    b.dispatcher
        .dispatch(
            client,
            Request::SendBulk {
                filename: Some("notes.txt".into()),
                data: "line one\nline two\n".into(),
            },
        )
        .await;

    assert_eq!(
        next_log(&mut sub).await,
        "Starting file upload: notes.txt (2 lines, 18 bytes)"
    );
    assert_eq!(
        next_log(&mut sub).await,
        "✓ File sent as a single frame (18 bytes)"
    );
    assert_eq!(b.device.frames().len(), 1);
}

#[tokio::test]
async fn test_stop_transfer_cancels_paced_upload() {
    let b = bridge(TransferConfig {
        mode: TransferMode::Paced,
        chunk_size: 10,
        frame_delay_ms: 10_000,
        ..TransferConfig::default()
    });
    let client = ClientId::new();
    let mut sub = b.sink.subscribe(client);

    b.dispatcher
        .dispatch(
            client,
            Request::SendBulk {
                filename: None,
                data: "123456789\n".repeat(5),
            },
        )
        .await;
    assert!(next_log(&mut sub)
        .await
        .starts_with("Starting file upload: unknown.txt"));
    assert_eq!(
        next_log(&mut sub).await,
        "Splitting into 5 chunks for reliability..."
    );

    // a second upload while this one runs is refused
    b.dispatcher
        .dispatch(
            client,
            Request::SendBulk {
                filename: None,
                data: "other".into(),
            },
        )
        .await;
    assert_eq!(
        next_log(&mut sub).await,
        "Error: a file transfer is already in progress"
    );

    // the first chunk goes out before the pacing delay starts
    let device = b.device.clone();
    tokio::time::timeout(Duration::from_secs(5), async move {
        while device.frames().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first chunk never written");

    b.dispatcher.dispatch(client, Request::StopTransfer).await;
    assert_eq!(next_log(&mut sub).await, "Stopping transmission...");
    assert_eq!(
        next_log(&mut sub).await,
        "Transmission stopped after 1 of 5 chunks"
    );
    assert_eq!(b.device.frames().len(), 1);
}

#[tokio::test]
async fn test_stop_without_transfer_is_silent() {
    let b = bridge(TransferConfig::default());
    let client = ClientId::new();
    let mut sub = b.sink.subscribe(client);
    b.dispatcher.dispatch(client, Request::StopTransfer).await;
    assert_eq!(sub.try_recv(), None);
}

#[tokio::test]
async fn test_reconnect_broadcasts_result() {
    let b = bridge(TransferConfig::default());
    let mut sub = b.sink.subscribe(ClientId::new());

    b.bench.unplug("/dev/ttyACM0");
    let replacement = b.bench.plug("/dev/ttyACM1");
    b.dispatcher
        .dispatch(ClientId::new(), Request::Reconnect)
        .await;

    assert_eq!(next_log(&mut sub).await, "Reconnected to /dev/ttyACM1");
    assert_eq!(
        sub.recv().await,
        Some(Event::LinkStatus(LinkStatus::Open {
            path: "/dev/ttyACM1".into()
        }))
    );

    b.dispatcher
        .dispatch(
            ClientId::new(),
            Request::SendCommand {
                data: "CMD: help".into(),
            },
        )
        .await;
    assert_eq!(replacement.written(), b"CMD: help\n");
    assert!(b.device.written().is_empty());
}

#[tokio::test]
async fn test_reconnect_failure_is_reported() {
    let b = bridge(TransferConfig::default());
    let mut sub = b.sink.subscribe(ClientId::new());

    b.bench.unplug("/dev/ttyACM0");
    b.dispatcher
        .dispatch(ClientId::new(), Request::Reconnect)
        .await;

    assert!(next_log(&mut sub).await.starts_with("Failed to connect"));
    assert!(!b.dispatcher.context().link.is_open());
}
