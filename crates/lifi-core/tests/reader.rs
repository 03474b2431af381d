mod common;

use common::{candidates, wait_until, MemorySink, MockBench};
use lifi_core::events::EventSink;
use lifi_core::protocol::frame::MAX_LINE_LEN;
use lifi_core::protocol::{spawn_reader, ReaderConfig};
use pretty_assertions::assert_eq;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast() -> ReaderConfig {
    ReaderConfig {
        idle_poll_ms: 5,
        input_poll_ms: 1,
        error_backoff_ms: 20,
    }
}

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_forwards_status_lines_and_drops_echoes() {
    let bench = MockBench::new();
    let device = bench.plug("/dev/ttyACM0");
    let link = bench.link();
    link.open(&candidates(), 115200).unwrap();

    let sink = MemorySink::new();
    let reader = spawn_reader(
        link.clone(),
        sink.clone() as Arc<dyn EventSink>,
        fast(),
        CancellationToken::new(),
    )
    .unwrap();

    device.feed(b"PICO STARTED\r\nCMD: slot status\n\n   \nCurrent slot: A\nCMD:help\n");
    assert!(wait_until(WAIT, || sink.logs().len() >= 2));
    assert!(wait_until(WAIT, || device.pending_input() == 0));
    reader.shutdown();

    assert_eq!(sink.broadcast_logs(), vec!["PICO STARTED", "Current slot: A"]);
    assert!(sink.logs().iter().all(|l| !l.starts_with("CMD:")));
    assert_eq!(link.counters().lines_read, 6);
}

#[test]
fn test_line_split_across_reads() {
    let bench = MockBench::new();
    let device = bench.plug("/dev/ttyACM0");
    let link = bench.link();
    link.open(&candidates(), 115200).unwrap();

    let sink = MemorySink::new();
    let reader = spawn_reader(
        link.clone(),
        sink.clone() as Arc<dyn EventSink>,
        fast(),
        CancellationToken::new(),
    )
    .unwrap();

    device.feed(b"Key ID: 12");
    std::thread::sleep(Duration::from_millis(30));
    assert!(sink.logs().is_empty());

    device.feed(b"34ABCD\n");
    assert!(wait_until(WAIT, || !sink.logs().is_empty()));
    reader.shutdown();
    assert_eq!(sink.logs(), vec!["Key ID: 1234ABCD"]);
}

#[test]
fn test_survives_disconnect_and_sees_reconnect() {
    let bench = MockBench::new();
    let first = bench.plug("/dev/ttyACM0");
    let link = bench.link();
    link.open(&candidates(), 115200).unwrap();

    let sink = MemorySink::new();
    let reader = spawn_reader(
        link.clone(),
        sink.clone() as Arc<dyn EventSink>,
        fast(),
        CancellationToken::new(),
    )
    .unwrap();

    // unplugged mid-read: errors are swallowed, nothing is published
    first.set_read_error(Some(io::ErrorKind::BrokenPipe));
    std::thread::sleep(Duration::from_millis(30));
    assert!(reader.is_running());
    assert!(sink.logs().is_empty());

    bench.unplug("/dev/ttyACM0");
    let second = bench.plug("/dev/ttyACM1");
    link.reconnect(&candidates(), 115200).unwrap();

    second.feed(b"PICO STARTED\n");
    assert!(wait_until(WAIT, || !sink.logs().is_empty()));
    reader.shutdown();
    assert_eq!(sink.logs(), vec!["PICO STARTED"]);
}

#[test]
fn test_unexpected_error_backs_off_and_continues() {
    let bench = MockBench::new();
    let device = bench.plug("/dev/ttyACM0");
    let link = bench.link();
    link.open(&candidates(), 115200).unwrap();

    let sink = MemorySink::new();
    let reader = spawn_reader(
        link.clone(),
        sink.clone() as Arc<dyn EventSink>,
        fast(),
        CancellationToken::new(),
    )
    .unwrap();

    device.set_read_error(Some(io::ErrorKind::InvalidData));
    std::thread::sleep(Duration::from_millis(50));
    assert!(reader.is_running());

    device.set_read_error(None);
    device.feed(b"back again\n");
    assert!(wait_until(WAIT, || !sink.logs().is_empty()));
    reader.shutdown();
    assert_eq!(sink.logs(), vec!["back again"]);
}

#[test]
fn test_idles_without_link_and_stops_on_shutdown() {
    let bench = MockBench::new();
    let link = bench.link();
    let sink = MemorySink::new();
    let token = CancellationToken::new();

    let reader = spawn_reader(
        link,
        sink.clone() as Arc<dyn EventSink>,
        fast(),
        token.clone(),
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert!(reader.is_running());

    token.cancel();
    assert!(wait_until(WAIT, || !reader.is_running()));
    assert!(sink.envelopes().is_empty());
}

#[test]
fn test_runaway_line_is_forwarded_in_bounded_pieces() {
    let bench = MockBench::new();
    let device = bench.plug("/dev/ttyACM0");
    let link = bench.link();
    link.open(&candidates(), 115200).unwrap();

    let sink = MemorySink::new();
    let reader = spawn_reader(
        link.clone(),
        sink.clone() as Arc<dyn EventSink>,
        fast(),
        CancellationToken::new(),
    )
    .unwrap();

    // a wrong device spewing bytes with no line breaks
    device.feed(&vec![b'x'; 10_000]);
    assert!(wait_until(WAIT, || sink.logs().len() >= 3));
    reader.shutdown();

    let lengths: Vec<usize> = sink.logs().iter().map(String::len).collect();
    assert_eq!(lengths, vec![MAX_LINE_LEN, MAX_LINE_LEN, 10_000 - 2 * MAX_LINE_LEN]);
}

#[test]
fn test_unterminated_line_is_forwarded_after_idle() {
    let bench = MockBench::new();
    let device = bench.plug("/dev/ttyACM0");
    let link = bench.link();
    link.open(&candidates(), 115200).unwrap();

    let sink = MemorySink::new();
    let reader = spawn_reader(
        link.clone(),
        sink.clone() as Arc<dyn EventSink>,
        fast(),
        CancellationToken::new(),
    )
    .unwrap();

    device.feed(b"Enter key ID> ");
    std::thread::sleep(Duration::from_millis(100));
    assert!(sink.logs().is_empty());

    assert!(wait_until(WAIT, || !sink.logs().is_empty()));
    reader.shutdown();
    assert_eq!(sink.logs(), vec!["Enter key ID>"]);
}
