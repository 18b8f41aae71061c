//! Estimating flash completion from esptool's console output.
//!
//! esptool reports its work as free text. Three kinds of lines carry
//! information:
//!
//! ```text
//! Compressed 204800 bytes to 120113...
//! Writing at 0x00019000... (50 %)
//! Hash of data verified.
//! ```
//!
//! The size announcement starts a segment and fixes the denominator, write
//! lines give an address that is turned into a ratio of that size, and the
//! verification line marks the end. Everything else is ignored.
//!
//! The tracker never goes backwards within a session: a new segment with a
//! smaller ratio, or a write at one of the image base offsets, leaves the
//! reported percentage where it was. This keeps a progress bar from jumping
//! around while the tool moves between images.

use std::sync::LazyLock;

use log::{trace, warn};
use regex::Regex;

use crate::error::{NumericField, ParseError};

/// Image base offsets where esptool starts a new write region.
///
/// Bootloader (0x0 on newer chips, 0x1000 on ESP32), partition table and OTA
/// data. A write reported at one of these addresses belongs to the next
/// segment and must not be measured against the previous segment's size.
pub const RESET_POINT_ADDRESSES: &[u64] = &[0x0000, 0x1000, 0x8000, 0xE000];

/// Phrase esptool prints once a segment's checksum matched.
pub const VERIFIED_MARKER: &str = "hash of data verified";

#[allow(clippy::unwrap_used)] // Static pattern
static PAYLOAD_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bcompressed\s+(\S+)\s+bytes\b").unwrap());

#[allow(clippy::unwrap_used)] // Static pattern
static WRITE_AT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bwriting\s+at\s+(0x\S*?)(?:\.\.\.|\x{2026})").unwrap()
});

/// Information extracted from one line of tool output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Size in bytes of the segment about to be written.
    PayloadSize(u64),
    /// Write in progress at a flash address.
    WriteAt(u64),
    /// The written data passed verification.
    Verified,
}

/// Classify one line of flashing tool output.
///
/// Returns `Ok(None)` for lines that carry no progress information and
/// `Err` when a line has the shape of a progress line but its number is
/// unreadable.
pub fn classify(line: &str) -> Result<Option<ProgressEvent>, ParseError> {
    if let Some(caps) = PAYLOAD_SIZE.captures(line) {
        let text = &caps[1];
        return parse_byte_count(text)
            .map(|n| Some(ProgressEvent::PayloadSize(n)))
            .ok_or_else(|| ParseError {
                field: NumericField::ByteCount,
                text: text.to_string(),
                line: line.to_string(),
            });
    }

    if let Some(caps) = WRITE_AT.captures(line) {
        let text = &caps[1];
        return parse_address(text)
            .map(|addr| Some(ProgressEvent::WriteAt(addr)))
            .ok_or_else(|| ParseError {
                field: NumericField::Address,
                text: text.to_string(),
                line: line.to_string(),
            });
    }

    if line.to_lowercase().contains(VERIFIED_MARKER) {
        return Ok(Some(ProgressEvent::Verified));
    }

    Ok(None)
}

/// Parse a decimal byte count, ignoring `,` `_` and `'` group separators.
fn parse_byte_count(text: &str) -> Option<u64> {
    let digits: String = text
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | '\''))
        .collect();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Parse a `0x`-prefixed hexadecimal address.
fn parse_address(text: &str) -> Option<u64> {
    let hex = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))?;
    if hex.is_empty() {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

/// Incremental percentage estimate for one flashing session.
///
/// Feed lines in the order the tool produced them. The tracker holds no
/// locks; a host that observes on one thread and reads on another must
/// serialize access itself.
///
/// ```rust
/// use espflasher::FlashProgressTracker;
///
/// let mut tracker = FlashProgressTracker::new();
/// tracker.observe("Compressed 204,800 bytes to 120,113...");
/// tracker.observe("Writing at 0x00019000... (50 %)");
/// assert_eq!(tracker.percent(), 50);
/// tracker.observe("Hash of data verified.");
/// assert_eq!(tracker.percent(), 100);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashProgressTracker {
    total_size_bytes: u64,
    current_percent: u8,
    segments: usize,
}

impl FlashProgressTracker {
    /// Create a tracker in the idle state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Current estimate, 0 to 100.
    pub fn percent(&self) -> u8 {
        self.current_percent
    }

    /// Size of the current segment, 0 when unknown.
    pub fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes
    }

    /// Number of size announcements seen in this session.
    pub fn segments(&self) -> usize {
        self.segments
    }

    /// Consume one line of tool output.
    ///
    /// Never fails: unrecognised lines are skipped and malformed numbers are
    /// logged and dropped without touching the estimate.
    pub fn observe(&mut self, line: &str) {
        match classify(line) {
            Ok(Some(event)) => self.apply(event),
            Ok(None) => {},
            Err(e) => warn!("Ignoring progress line: {e}"),
        }
    }

    /// Apply an already classified event.
    pub fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::PayloadSize(size) => {
                trace!("Segment {} announced: {size} bytes", self.segments + 1);
                self.total_size_bytes = size;
                self.segments += 1;
            },
            ProgressEvent::WriteAt(address) => {
                if RESET_POINT_ADDRESSES.contains(&address) {
                    trace!("Write at base offset {address:#x}, holding at {}%", self.current_percent);
                    return;
                }
                if self.total_size_bytes == 0 {
                    return;
                }
                let ratio =
                    u128::from(address) * 100 / u128::from(self.total_size_bytes);
                let percent = u8::try_from(ratio.min(100)).unwrap_or(100);
                self.advance(percent);
            },
            ProgressEvent::Verified => {
                self.current_percent = 100;
            },
        }
    }

    fn advance(&mut self, percent: u8) {
        if percent > self.current_percent {
            self.current_percent = percent;
        }
    }
}
