//! Guessing which serial port the target board is attached to.
//!
//! ESP32 development boards expose their UART through a USB-to-serial bridge
//! chip, and the bridge name usually shows up in the driver description. The
//! guesser matches two tiers of case-insensitive name fragments against the
//! device path and description:
//!
//! - priority: `cp210`, `ch340` (the bridges found on most ESP32 boards)
//! - secondary: `ch910`, `ft232`, `pl2303`, `usb serial`
//!
//! This is a whitelist. A board behind an unlisted bridge (or native USB CDC
//! without a descriptive driver string) is not recognised, and an unrelated
//! adapter using a listed chip will be picked. Both are accepted limitations;
//! callers fall back to explicit selection when the guess is `None` or wrong.
//!
//! ## Example
//!
//! ```rust
//! use espflasher::{PortGuesser, SerialPortDescriptor};
//!
//! let ports = vec![
//!     SerialPortDescriptor::new("/dev/ttyX", "generic"),
//!     SerialPortDescriptor::new("/dev/ttyACM0", "CP210x UART Bridge"),
//! ];
//! assert_eq!(PortGuesser::default().select(&ports).as_deref(), Some("/dev/ttyACM0"));
//! ```

use crate::device::SerialPortDescriptor;

/// Bridge fragments tried first.
pub const PRIORITY_IDENTIFIERS: &[&str] = &["cp210", "ch340"];

/// Bridge and vendor fragments tried when no priority fragment matches.
pub const SECONDARY_IDENTIFIERS: &[&str] = &["ch910", "ft232", "pl2303", "usb serial"];

/// Two-tier port selection heuristic.
///
/// Stateless: every call looks only at the list it is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortGuesser {
    priority: Vec<String>,
    secondary: Vec<String>,
}

impl Default for PortGuesser {
    fn default() -> Self {
        Self::new(PRIORITY_IDENTIFIERS, SECONDARY_IDENTIFIERS)
    }
}

impl PortGuesser {
    /// Create a guesser with custom identifier tiers.
    ///
    /// Identifiers are compared lower-cased; empty entries are dropped since
    /// they would match every port.
    pub fn new<S: AsRef<str>>(priority: &[S], secondary: &[S]) -> Self {
        fn normalize<S: AsRef<str>>(ids: &[S]) -> Vec<String> {
            ids.iter()
                .map(|id| id.as_ref().trim().to_lowercase())
                .filter(|id| !id.is_empty())
                .collect()
        }

        Self {
            priority: normalize(priority),
            secondary: normalize(secondary),
        }
    }

    /// Priority tier identifiers.
    pub fn priority(&self) -> &[String] {
        &self.priority
    }

    /// Secondary tier identifiers.
    pub fn secondary(&self) -> &[String] {
        &self.secondary
    }

    /// Pick the port most likely to be the target board.
    ///
    /// The first port (in input order) matching the priority tier wins, even
    /// when a secondary match appears earlier in the list. `None` means no
    /// port is identifiable; that is a normal outcome, not an error.
    pub fn select(&self, ports: &[SerialPortDescriptor]) -> Option<String> {
        Self::first_match(&self.priority, ports)
            .or_else(|| Self::first_match(&self.secondary, ports))
            .map(|port| port.device.clone())
    }

    /// Keep `current` while it is still attached, otherwise guess again.
    ///
    /// Meant for periodic polling: a user's choice survives as long as the
    /// device exists, and an unplugged device is replaced by a fresh guess.
    pub fn refresh(&self, current: Option<&str>, ports: &[SerialPortDescriptor]) -> Option<String> {
        match current {
            Some(device) if ports.iter().any(|p| p.device == device) => Some(device.to_string()),
            _ => self.select(ports),
        }
    }

    /// Whether the port matches either tier.
    pub fn is_recognised(&self, port: &SerialPortDescriptor) -> bool {
        Self::matches(&self.priority, port) || Self::matches(&self.secondary, port)
    }

    fn first_match<'a>(
        identifiers: &[String],
        ports: &'a [SerialPortDescriptor],
    ) -> Option<&'a SerialPortDescriptor> {
        ports.iter().find(|port| Self::matches(identifiers, port))
    }

    fn matches(identifiers: &[String], port: &SerialPortDescriptor) -> bool {
        let device = port.device.to_lowercase();
        let description = port.description.to_lowercase();
        identifiers
            .iter()
            .any(|id| device.contains(id.as_str()) || description.contains(id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(device: &str, description: &str) -> SerialPortDescriptor {
        SerialPortDescriptor::new(device, description)
    }

    #[test]
    fn test_select_bridge_after_generic_port() {
        let ports = vec![
            port("/dev/ttyX", "generic"),
            port("/dev/ttyACM0", "CP210x UART Bridge"),
        ];
        assert_eq!(
            PortGuesser::default().select(&ports).as_deref(),
            Some("/dev/ttyACM0")
        );
    }

    #[test]
    fn test_priority_beats_earlier_secondary() {
        let ports = vec![
            port("/dev/ttyUSB0", "FT232R USB UART"),
            port("/dev/ttyUSB1", "Prolific PL2303"),
            port("/dev/ttyUSB2", "USB2.0-Serial (QinHeng) CH340"),
        ];
        assert_eq!(
            PortGuesser::default().select(&ports).as_deref(),
            Some("/dev/ttyUSB2")
        );
    }

    #[test]
    fn test_secondary_when_no_priority() {
        let ports = vec![
            port("/dev/ttyS0", ""),
            port("/dev/ttyUSB0", "FT232R USB UART"),
        ];
        assert_eq!(
            PortGuesser::default().select(&ports).as_deref(),
            Some("/dev/ttyUSB0")
        );
    }

    #[test]
    fn test_first_match_in_input_order() {
        let ports = vec![port("COM4", "Silicon Labs CP2102"), port("COM3", "CP2104")];
        assert_eq!(PortGuesser::default().select(&ports).as_deref(), Some("COM4"));
    }

    #[test]
    fn test_matches_device_name() {
        let ports = vec![port("/dev/cu.usbserial-CH340-1410", "")];
        assert_eq!(
            PortGuesser::default().select(&ports).as_deref(),
            Some("/dev/cu.usbserial-CH340-1410")
        );
    }

    #[test]
    fn test_case_insensitive() {
        let ports = vec![port("COM7", "USB SERIAL CH910X")];
        assert_eq!(PortGuesser::default().select(&ports).as_deref(), Some("COM7"));
    }

    #[test]
    fn test_empty_list_is_none() {
        assert_eq!(PortGuesser::default().select(&[]), None);
    }

    #[test]
    fn test_unidentifiable_is_none() {
        let ports = vec![port("/dev/ttyS0", ""), port("/dev/ttyACM0", "Arduino Uno")];
        assert_eq!(PortGuesser::default().select(&ports), None);
    }

    #[test]
    fn test_select_is_idempotent() {
        let guesser = PortGuesser::default();
        let ports = vec![port("/dev/ttyUSB0", "CP2102"), port("/dev/ttyUSB1", "CH340")];
        let first = guesser.select(&ports);
        assert_eq!(guesser.select(&ports), first);
        assert_eq!(guesser.select(&ports), first);
    }

    #[test]
    fn test_refresh_keeps_present_selection() {
        let guesser = PortGuesser::default();
        let ports = vec![port("/dev/ttyUSB0", "CP2102"), port("/dev/ttyS0", "")];
        assert_eq!(
            guesser.refresh(Some("/dev/ttyS0"), &ports).as_deref(),
            Some("/dev/ttyS0")
        );
    }

    #[test]
    fn test_refresh_replaces_vanished_selection() {
        let guesser = PortGuesser::default();
        let ports = vec![port("/dev/ttyUSB1", "CP2102")];
        assert_eq!(
            guesser.refresh(Some("/dev/ttyUSB0"), &ports).as_deref(),
            Some("/dev/ttyUSB1")
        );
        assert_eq!(guesser.refresh(None, &ports).as_deref(), Some("/dev/ttyUSB1"));
    }

    #[test]
    fn test_refresh_vanished_without_candidate() {
        let guesser = PortGuesser::default();
        assert_eq!(guesser.refresh(Some("/dev/ttyUSB0"), &[]), None);
    }

    #[test]
    fn test_custom_tiers_drop_empty_identifiers() {
        let guesser = PortGuesser::new(&["", " ESP-Prog "], &[]);
        assert_eq!(guesser.priority(), ["esp-prog".to_string()]);
        assert!(guesser.secondary().is_empty());

        let ports = vec![port("/dev/ttyUSB0", "generic"), port("/dev/ttyUSB1", "ESP-Prog JTAG")];
        assert_eq!(guesser.select(&ports).as_deref(), Some("/dev/ttyUSB1"));
    }

    #[test]
    fn test_is_recognised() {
        let guesser = PortGuesser::default();
        assert!(guesser.is_recognised(&port("COM3", "CP2102")));
        assert!(guesser.is_recognised(&port("COM3", "pl2303")));
        assert!(!guesser.is_recognised(&port("COM1", "Communications Port")));
    }
}
