//! In-memory serial devices and event sinks shared by the integration tests

#![allow(dead_code)]

use lifi_core::events::{Envelope, Event, EventSink, Target};
use lifi_core::protocol::{LinkChannel, LinkError, LinkManager, PortOpener};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap()
}

/// One simulated device: what the host wrote and what it will read
#[derive(Default)]
pub struct DeviceState {
    pub written: Vec<u8>,
    pub inbound: VecDeque<u8>,
    pub fail_writes: bool,
    pub read_error: Option<io::ErrorKind>,
    pub write_delay: Duration,
}

#[derive(Clone, Default)]
pub struct MockDevice(Arc<Mutex<DeviceState>>);

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> Vec<u8> {
        lock(&self.0).written.clone()
    }

    /// Written bytes split into frames, terminators removed
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.written()
            .split(|&b| b == b'\n')
            .filter(|f| !f.is_empty())
            .map(|f| f.to_vec())
            .collect()
    }

    pub fn feed(&self, bytes: &[u8]) {
        lock(&self.0).inbound.extend(bytes.iter());
    }

    pub fn set_fail_writes(&self, fail: bool) {
        lock(&self.0).fail_writes = fail;
    }

    /// Every write takes at least this long
    pub fn set_write_delay(&self, delay: Duration) {
        lock(&self.0).write_delay = delay;
    }

    pub fn set_read_error(&self, kind: Option<io::ErrorKind>) {
        lock(&self.0).read_error = kind;
    }

    pub fn pending_input(&self) -> usize {
        lock(&self.0).inbound.len()
    }
}

impl Read for MockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.0);
        if let Some(kind) = state.read_error {
            return Err(io::Error::new(kind, "mock read failure"));
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let delay = lock(&self.0).write_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut state = lock(&self.0);
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LinkChannel for MockDevice {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        let state = lock(&self.0);
        if let Some(kind) = state.read_error {
            return Err(io::Error::new(kind, "mock read failure"));
        }
        Ok(state.inbound.len() as u32)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        lock(&self.0).inbound.clear();
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn LinkChannel>> {
        Ok(Box::new(self.clone()))
    }
}

/// A bench of devices keyed by path; unknown or unplugged paths fail to open
#[derive(Clone, Default)]
pub struct MockBench {
    devices: Arc<Mutex<HashMap<String, MockDevice>>>,
    opens: Arc<Mutex<Vec<String>>>,
}

impl MockBench {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plug(&self, path: &str) -> MockDevice {
        let device = MockDevice::new();
        lock(&self.devices).insert(path.to_string(), device.clone());
        device
    }

    pub fn unplug(&self, path: &str) {
        lock(&self.devices).remove(path);
    }

    /// Paths successfully opened, in order
    pub fn opens(&self) -> Vec<String> {
        lock(&self.opens).clone()
    }

    pub fn link(&self) -> Arc<LinkManager> {
        self.link_with_settle(Duration::ZERO)
    }

    pub fn link_with_settle(&self, settle: Duration) -> Arc<LinkManager> {
        Arc::new(LinkManager::new(Box::new(self.clone()), settle))
    }
}

impl PortOpener for MockBench {
    fn open(&self, path: &str, _baud_rate: u32) -> Result<Box<dyn LinkChannel>, LinkError> {
        let device = lock(&self.devices).get(path).cloned();
        match device {
            Some(device) => {
                lock(&self.opens).push(path.to_string());
                Ok(Box::new(device))
            }
            None => Err(LinkError::LinkIo(format!("{}: No such file or directory", path))),
        }
    }
}

/// Records every published envelope
#[derive(Default)]
pub struct MemorySink {
    envelopes: Mutex<Vec<Envelope>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        lock(&self.envelopes).clone()
    }

    /// Text of every log message, regardless of target
    pub fn logs(&self) -> Vec<String> {
        self.envelopes()
            .into_iter()
            .filter_map(|e| match e.event {
                Event::LogMessage(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn broadcast_logs(&self) -> Vec<String> {
        self.envelopes()
            .into_iter()
            .filter_map(|e| match (e.target, e.event) {
                (Target::All, Event::LogMessage(text)) => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, envelope: Envelope) {
        lock(&self.envelopes).push(envelope);
    }
}

pub fn candidates() -> Vec<String> {
    vec![
        "/dev/ttyACM0".to_string(),
        "/dev/ttyACM1".to_string(),
        "/dev/ttyACM2".to_string(),
    ]
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
