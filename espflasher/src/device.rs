//! Serial port discovery.
//!
//! Enumeration is delegated to the `serialport` crate. Each endpoint is reduced
//! to a [`SerialPortDescriptor`]: the device path plus a free-text description
//! assembled from whatever driver metadata the OS reports.

use std::time::{Duration, Instant};

use log::info;
#[cfg(feature = "native")]
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::port_guess::PortGuesser;

/// A serial endpoint as reported by the OS at one instant.
///
/// `device` is unique among the ports attached right now, but a board may
/// come back under another name after a replug.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialPortDescriptor {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub device: String,
    /// Human-readable driver metadata, may be empty.
    pub description: String,
}

impl SerialPortDescriptor {
    /// Create a descriptor.
    pub fn new(device: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            description: description.into(),
        }
    }
}

/// Build the description for a USB endpoint.
///
/// `"CP2102 USB to UART Bridge Controller (Silicon Labs) [10C4:EA60]"`
#[cfg(feature = "native")]
fn usb_description(
    product: Option<&str>,
    manufacturer: Option<&str>,
    vid: u16,
    pid: u16,
) -> String {
    let mut out = String::new();
    if let Some(product) = product.filter(|p| !p.trim().is_empty()) {
        out.push_str(product.trim());
    }
    if let Some(manufacturer) = manufacturer.filter(|m| !m.trim().is_empty()) {
        if out.is_empty() {
            out.push_str(manufacturer.trim());
        } else {
            out.push_str(&format!(" ({})", manufacturer.trim()));
        }
    }
    if !out.is_empty() {
        out.push(' ');
    }
    out.push_str(&format!("[{vid:04X}:{pid:04X}]"));
    out
}

/// Enumerate serial ports, sorted by device name without duplicates.
///
/// An enumeration failure is logged and reported as an empty list; callers
/// poll this periodically and treat "nothing attached" the same way.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<SerialPortDescriptor> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    let mut result: Vec<SerialPortDescriptor> = ports
        .into_iter()
        .map(|info| {
            let description = match info.port_type {
                serialport::SerialPortType::UsbPort(usb) => usb_description(
                    usb.product.as_deref(),
                    usb.manufacturer.as_deref(),
                    usb.vid,
                    usb.pid,
                ),
                serialport::SerialPortType::PciPort => "PCI".to_string(),
                serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                serialport::SerialPortType::Unknown => String::new(),
            };
            trace!("Found port: {} ({description})", info.port_name);
            SerialPortDescriptor::new(info.port_name, description)
        })
        .collect();

    result.sort_by(|a, b| a.device.cmp(&b.device));
    result.dedup_by(|a, b| a.device == b.device);
    result
}

/// Poll a port supplier until the guesser recognises a device.
///
/// The supplier is called once per `interval`; `timeout` bounds the wait.
/// Returns [`Error::DeviceNotFound`] on timeout and [`Error::Interrupted`]
/// when the interrupt checker fires.
pub fn poll_for_port<F>(
    guesser: &PortGuesser,
    mut supplier: F,
    interval: Duration,
    timeout: Duration,
) -> Result<String>
where
    F: FnMut() -> Vec<SerialPortDescriptor>,
{
    let started = Instant::now();
    loop {
        if let Some(device) = guesser.select(&supplier()) {
            info!("Detected {device}");
            return Ok(device);
        }
        if crate::is_interrupted_requested() {
            return Err(Error::Interrupted);
        }
        if started.elapsed() + interval > timeout {
            return Err(Error::DeviceNotFound);
        }
        std::thread::sleep(interval);
    }
}

/// [`poll_for_port`] against the live port list.
#[cfg(feature = "native")]
pub fn wait_for_port(guesser: &PortGuesser, timeout: Duration) -> Result<String> {
    poll_for_port(guesser, detect_ports, Duration::from_secs(1), timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "native")]
    #[test]
    fn test_usb_description_full() {
        let desc = usb_description(
            Some("CP2102 USB to UART Bridge Controller"),
            Some("Silicon Labs"),
            0x10C4,
            0xEA60,
        );
        assert_eq!(
            desc,
            "CP2102 USB to UART Bridge Controller (Silicon Labs) [10C4:EA60]"
        );
    }

    #[cfg(feature = "native")]
    #[test]
    fn test_usb_description_manufacturer_only() {
        let desc = usb_description(None, Some("wch.cn"), 0x1A86, 0x7523);
        assert_eq!(desc, "wch.cn [1A86:7523]");
    }

    #[cfg(feature = "native")]
    #[test]
    fn test_usb_description_ids_only() {
        let desc = usb_description(Some("  "), None, 0x0403, 0x6001);
        assert_eq!(desc, "[0403:6001]");
    }

    #[test]
    fn test_descriptor_new() {
        let port = SerialPortDescriptor::new("COM3", "");
        assert_eq!(port.device, "COM3");
        assert!(port.description.is_empty());
    }

    #[test]
    fn test_poll_finds_device_on_later_poll() {
        let mut polls = 0;
        let device = poll_for_port(
            &PortGuesser::default(),
            || {
                polls += 1;
                if polls < 3 {
                    vec![SerialPortDescriptor::new("/dev/ttyS0", "")]
                } else {
                    vec![
                        SerialPortDescriptor::new("/dev/ttyS0", ""),
                        SerialPortDescriptor::new("/dev/ttyUSB0", "CP2102"),
                    ]
                }
            },
            Duration::from_millis(1),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(device, "/dev/ttyUSB0");
        assert_eq!(polls, 3);
    }

    #[test]
    fn test_poll_times_out() {
        let err = poll_for_port(
            &PortGuesser::default(),
            Vec::new,
            Duration::from_millis(5),
            Duration::from_millis(20),
        )
        .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound));
    }

    #[cfg(feature = "native")]
    #[test]
    fn test_detect_ports_sorted_and_unique() {
        let ports = detect_ports();
        for pair in ports.windows(2) {
            assert!(pair[0].device < pair[1].device);
        }
    }
}
