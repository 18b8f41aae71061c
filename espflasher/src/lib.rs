//! # espflasher
//!
//! Orchestration helpers for flashing ESP32 firmware with esptool.
//!
//! The flashing itself is left to esptool. This crate covers everything
//! around it:
//!
//! - Estimating completion from esptool's text output ([`FlashProgressTracker`])
//! - Guessing which serial port the board is on ([`PortGuesser`])
//! - Unpacking firmware archives and mapping images to offsets
//! - Running esptool and streaming its output line by line
//! - A serial log viewer with bounded scrollback
//!
//! ## Features
//!
//! - `native` (default): serial port enumeration and the log viewer
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use espflasher::{EsptoolCommand, FirmwareOptions, FlashProgressTracker, PortGuesser};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bundle = espflasher::prepare_firmware(
//!         std::path::Path::new("release.zip"),
//!         &FirmwareOptions::default(),
//!     )?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let ports = espflasher::detect_ports();
//!         let port = PortGuesser::default()
//!             .select(&ports)
//!             .ok_or(espflasher::Error::DeviceNotFound)?;
//!
//!         let esptool = espflasher::find_esptool(None)?;
//!         let cmd = EsptoolCommand::new(esptool, "esp32", port, 460800, bundle.images);
//!
//!         let mut tracker = FlashProgressTracker::new();
//!         espflasher::esptool::run(&cmd, None, |_, line| {
//!             tracker.observe(line);
//!             println!("{:3}% {line}", tracker.percent());
//!         })?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod archive;
pub mod device;
pub mod error;
pub mod esptool;
pub mod monitor;
pub mod port_guess;
pub mod progress;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker for long-running loops.
///
/// The checker returns `true` once the current operation should stop, for
/// example after Ctrl-C in a CLI. Only the first registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Whether the embedding application asked to stop.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(feature = "native")]
pub use device::{detect_ports, wait_for_port};
#[cfg(feature = "native")]
pub use monitor::MonitorSession;
pub use {
    archive::{FirmwareBundle, FirmwareOptions, FlashImage, extract_zip, prepare_firmware},
    device::{SerialPortDescriptor, poll_for_port},
    error::{Error, NumericField, ParseError, Result},
    esptool::{EsptoolCommand, LineSplitter, ResetMode, Stream, find_esptool},
    monitor::{LogBuffer, clean_log_text, timestamp_prefix},
    port_guess::PortGuesser,
    progress::{FlashProgressTracker, ProgressEvent, classify},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        assert!(!is_interrupted_requested());
    }
}
