//! Serial port handling
//!
//! Port discovery, opening and the candidate probe used by the link manager.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;

use super::stream::{LinkChannel, SerialChannel};
use super::LinkError;

/// Read timeout applied to freshly opened ports
const PORT_TIMEOUT: Duration = Duration::from_secs(1);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                (Some(usb_info.vid), Some(usb_info.pid), usb_info.product)
            }
            _ => (None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

/// Sort key putting ttyACM* first, then ttyUSB*, then everything else.
/// The transmitter enumerates as a USB CDC device, so ttyACM is the likely match.
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // udev does not always report CDC devices; fall back to scanning /dev
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        product: None,
                    });
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port and apply the link settings
pub fn open_port(name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>, LinkError> {
    let mut port = serialport::new(name, baud_rate)
        .timeout(PORT_TIMEOUT)
        .open()?;
    configure_port(port.as_mut())?;
    Ok(port)
}

/// Configure a serial port: 8N1, no flow control, DTR asserted
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), LinkError> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;

    // USB CDC stacks only start sending once the host raises DTR
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!("configure_port: failed to set DTR high: {} (continuing)", e);
    }

    Ok(())
}

/// Opens a channel to a device path
pub trait PortOpener: Send + Sync {
    /// Open `path` as a byte channel
    fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn LinkChannel>, LinkError>;
}

/// Opens real serial ports through the `serialport` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn LinkChannel>, LinkError> {
        let port = open_port(path, baud_rate)?;
        Ok(Box::new(SerialChannel::new(port)))
    }
}

/// Try each candidate in order and return the first that opens.
///
/// An empty candidate list falls back to the discovered ports.
pub fn probe(
    opener: &dyn PortOpener,
    candidates: &[String],
    baud_rate: u32,
) -> Result<(String, Box<dyn LinkChannel>), LinkError> {
    let discovered;
    let candidates = if candidates.is_empty() {
        discovered = list_ports().into_iter().map(|p| p.name).collect::<Vec<_>>();
        &discovered[..]
    } else {
        candidates
    };

    for path in candidates {
        tracing::debug!("Trying {}...", path);
        match opener.open(path, baud_rate) {
            Ok(channel) => return Ok((path.clone(), channel)),
            Err(e) => tracing::debug!("{} did not open: {}", path, e),
        }
    }

    Err(LinkError::PortUnavailable {
        candidates: candidates.to_vec(),
    })
}
