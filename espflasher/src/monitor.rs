//! Serial log viewer primitives.
//!
//! A [`MonitorSession`] owns the serial connection; the bytes it delivers go
//! into a [`LogBuffer`], which keeps the most recent complete lines for display
//! and for copying out as a whole.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(feature = "native")]
use std::io::Write as _;

/// Lines kept by [`LogBuffer::default`].
pub const DEFAULT_SCROLLBACK: usize = 1000;

/// Unterminated output longer than this is emitted as a line of its own.
pub const MAX_LINE_BYTES: usize = 4096;

/// How long DTR/RTS are held during [`MonitorSession::pulse_reset`].
#[cfg(feature = "native")]
const RESET_PULSE: std::time::Duration = std::time::Duration::from_millis(100);

/// An open serial connection for log viewing.
#[cfg(feature = "native")]
pub struct MonitorSession {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

#[cfg(feature = "native")]
impl MonitorSession {
    /// Open `port_name` at `baud_rate`.
    pub fn open(port_name: &str, baud_rate: u32) -> crate::Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(std::time::Duration::from_millis(50))
            .open()?;
        log::debug!("Opened {port_name} at {baud_rate} baud");
        Ok(Self {
            port,
            name: port_name.to_string(),
        })
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A second handle for a background read loop.
    pub fn try_clone_reader(&self) -> crate::Result<Box<dyn serialport::SerialPort>> {
        Ok(self.port.try_clone()?)
    }

    /// Send bytes to the device.
    pub fn write_bytes(&mut self, data: &[u8]) -> crate::Result<()> {
        self.port.write_all(data)?;
        Ok(())
    }

    /// Reboot the board into the application.
    ///
    /// Pulls EN low through RTS while DTR stays released (GPIO0 high), the
    /// same wiring esptool relies on for its hard reset.
    pub fn pulse_reset(&mut self) -> crate::Result<()> {
        self.port.write_data_terminal_ready(false)?;
        self.port.write_request_to_send(true)?;
        std::thread::sleep(RESET_PULSE);
        self.port.write_request_to_send(false)?;
        log::info!("Reset pulse sent on {}", self.name);
        Ok(())
    }
}

#[cfg(not(feature = "native"))]
/// Placeholder for builds without serial support.
pub struct MonitorSession;

#[cfg(not(feature = "native"))]
impl MonitorSession {
    /// Always fails without the `native` feature.
    pub fn open(_port_name: &str, _baud_rate: u32) -> crate::Result<Self> {
        Err(crate::Error::Unsupported(
            "Serial monitor requires the native feature".to_string(),
        ))
    }
}

/// Bounded scrollback of complete log lines.
///
/// Chunks can end mid-line or mid-character; the unfinished tail is held
/// until the rest arrives. `\r\n` and lone `\r` both end a line, and so does
/// reaching [`MAX_LINE_BYTES`] without either.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    partial: Vec<u8>,
    capacity: usize,
    last_was_cr: bool,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SCROLLBACK)
    }
}

impl LogBuffer {
    /// Keep at most `capacity` lines (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(DEFAULT_SCROLLBACK)),
            partial: Vec::new(),
            capacity,
            last_was_cr: false,
        }
    }

    /// Append raw bytes, returning the lines they completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut completed = Vec::new();
        for &b in bytes {
            match b {
                b'\n' if self.last_was_cr => {
                    // second half of "\r\n"
                    self.last_was_cr = false;
                },
                b'\n' | b'\r' => {
                    self.last_was_cr = b == b'\r';
                    let line = clean_log_text(&String::from_utf8_lossy(&self.partial));
                    self.partial.clear();
                    self.store(line.clone());
                    completed.push(line);
                },
                _ => {
                    self.last_was_cr = false;
                    self.partial.push(b);
                    if self.partial.len() >= MAX_LINE_BYTES {
                        let line = self.split_long_line();
                        self.store(line.clone());
                        completed.push(line);
                    }
                },
            }
        }
        completed
    }

    /// Take the held bytes as a line, keeping a trailing incomplete UTF-8
    /// sequence for the next chunk.
    fn split_long_line(&mut self) -> String {
        let cut = match std::str::from_utf8(&self.partial) {
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            _ => self.partial.len(),
        };
        let rest = self.partial.split_off(cut);
        let line = clean_log_text(&String::from_utf8_lossy(&self.partial));
        self.partial = rest;
        line
    }

    fn store(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Stored complete lines, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Number of stored lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }

    /// Drop everything, including an unfinished line.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
        self.last_was_cr = false;
    }

    /// The whole scrollback as one text block, unfinished line included.
    pub fn contents(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        if !self.partial.is_empty() {
            out.push_str(&clean_log_text(&String::from_utf8_lossy(&self.partial)));
        }
        out
    }
}

/// Drop control characters other than tab.
pub fn clean_log_text(text: &str) -> String {
    text.chars()
        .filter(|&ch| ch == '\t' || !ch.is_control())
        .collect()
}

/// `[HH:MM:SS.mmm] ` in UTC for the current time.
pub fn timestamp_prefix() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    format!(
        "[{:02}:{:02}:{:02}.{:03}] ",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
        now.subsec_millis()
    )
}
