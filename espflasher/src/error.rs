//! Error types for espflasher.

use std::io;
use thiserror::Error;

/// Result type for espflasher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for espflasher operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (files, child process pipes).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Firmware archive could not be read.
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Firmware input is unusable (no images, bad layout file, unknown type).
    #[error("Invalid firmware: {0}")]
    Firmware(String),

    /// The flashing tool could not be located.
    #[error("esptool not found (tried: {tried})")]
    ToolNotFound {
        /// Candidates that were probed.
        tried: String,
    },

    /// The flashing tool exited unsuccessfully.
    #[error("esptool failed ({}): {output}", exit_label(.code))]
    ToolFailed {
        /// Process exit code, `None` when terminated by a signal.
        code: Option<i32>,
        /// Last lines the tool printed, stdout and stderr interleaved.
        output: String,
    },

    /// Operation did not finish in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Operation was interrupted by the embedding application.
    #[error("Interrupted")]
    Interrupted,

    /// No serial device could be found.
    #[error("No serial device found")]
    DeviceNotFound,

    /// Unsupported operation on this build.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

#[allow(clippy::ref_option, clippy::trivially_copy_pass_by_ref)]
fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "killed".to_string(), |c| format!("exit code {c}"))
}

/// Numeric field of a recognised tool output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericField {
    /// Byte count of a compressed size announcement.
    ByteCount,
    /// Hexadecimal address of a write progress line.
    Address,
}

impl std::fmt::Display for NumericField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ByteCount => f.write_str("byte count"),
            Self::Address => f.write_str("address"),
        }
    }
}

/// A recognised progress line whose number could not be parsed.
///
/// Never surfaced from [`FlashProgressTracker::observe`](crate::FlashProgressTracker::observe);
/// it is logged and the line is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed {field} {text:?} in line {line:?}")]
pub struct ParseError {
    /// Which field failed.
    pub field: NumericField,
    /// The offending text.
    pub text: String,
    /// The whole line.
    pub line: String,
}
