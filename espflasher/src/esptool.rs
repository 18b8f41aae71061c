//! Running esptool and streaming its output.
//!
//! The flashing protocol is entirely esptool's business. This module builds
//! the command line, runs the process and hands every output line to the
//! caller as it appears, so a [`FlashProgressTracker`](crate::FlashProgressTracker)
//! can follow along.
//!
//! ```text
//! child stdout ──reader thread──┐
//!                               ├── mpsc ──> caller thread: on_line(...)
//! child stderr ──reader thread──┘
//! ```
//!
//! esptool redraws its progress line with carriage returns when attached to
//! a terminal, so output is split on both `\r` and `\n`.

use std::collections::VecDeque;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::archive::FlashImage;
use crate::error::{Error, Result};

/// Program names probed when no explicit path is configured.
pub const ESPTOOL_CANDIDATES: &[&str] = &["esptool", "esptool.py"];

/// Number of output lines, from either stream, kept for error reports.
const ERROR_TAIL_LINES: usize = 8;

/// How often the run loop checks for timeout and interruption.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Reset strategy before/after flashing, as esptool names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ResetMode {
    /// DTR/RTS reset into the bootloader (before) or the app (after).
    #[default]
    Default,
    /// Leave the chip alone.
    NoReset,
}

impl ResetMode {
    fn before_arg(self) -> &'static str {
        match self {
            Self::Default => "default_reset",
            Self::NoReset => "no_reset",
        }
    }

    fn after_arg(self) -> &'static str {
        match self {
            Self::Default => "hard_reset",
            Self::NoReset => "no_reset",
        }
    }
}

/// A `write_flash` invocation.
#[derive(Debug, Clone)]
pub struct EsptoolCommand {
    /// esptool executable.
    pub program: PathBuf,
    /// Chip name (`esp32`, `esp32s3`, ...).
    pub chip: String,
    /// Serial port.
    pub port: String,
    /// Transfer baud rate.
    pub baud: u32,
    /// Reset before flashing.
    pub before: ResetMode,
    /// Reset after flashing.
    pub after: ResetMode,
    /// Compress data in transfer (`-z`).
    pub compress: bool,
    /// Images to write.
    pub images: Vec<FlashImage>,
}

impl EsptoolCommand {
    /// Create a command with default reset behaviour and compression.
    pub fn new(
        program: impl Into<PathBuf>,
        chip: impl Into<String>,
        port: impl Into<String>,
        baud: u32,
        images: Vec<FlashImage>,
    ) -> Self {
        Self {
            program: program.into(),
            chip: chip.into(),
            port: port.into(),
            baud,
            before: ResetMode::Default,
            after: ResetMode::Default,
            compress: true,
            images,
        }
    }

    /// Arguments after the program name.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--chip".to_string(),
            self.chip.clone(),
            "--port".to_string(),
            self.port.clone(),
            "--baud".to_string(),
            self.baud.to_string(),
            "--before".to_string(),
            self.before.before_arg().to_string(),
            "--after".to_string(),
            self.after.after_arg().to_string(),
            "write_flash".to_string(),
        ];
        if self.compress {
            args.push("-z".to_string());
        }
        for image in &self.images {
            args.push(format!("{:#x}", image.offset));
            args.push(image.path.display().to_string());
        }
        args
    }

    /// Printable command line.
    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in self.args() {
            out.push(' ');
            if arg.contains(' ') {
                out.push('"');
                out.push_str(&arg);
                out.push('"');
            } else {
                out.push_str(&arg);
            }
        }
        out
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

/// Locate esptool.
///
/// An explicit path is returned as long as it exists. Otherwise each name in
/// [`ESPTOOL_CANDIDATES`] is probed by running `<name> version`.
pub fn find_esptool(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() || probe(path) {
            return Ok(path.to_path_buf());
        }
        return Err(Error::ToolNotFound {
            tried: path.display().to_string(),
        });
    }

    for candidate in ESPTOOL_CANDIDATES {
        if probe(Path::new(candidate)) {
            debug!("Found esptool as {candidate}");
            return Ok(PathBuf::from(candidate));
        }
    }

    Err(Error::ToolNotFound {
        tried: ESPTOOL_CANDIDATES.join(", "),
    })
}

fn probe(program: &Path) -> bool {
    Command::new(program)
        .arg("version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Incremental splitter from raw bytes to text lines.
///
/// Lines end at `\n` or `\r`; empty lines are dropped. Multi-byte UTF-8
/// sequences split across reads are reassembled and invalid bytes become
/// `U+FFFD`.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Create an empty splitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add bytes and return the lines they completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                self.take_line(&mut lines);
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Flush a trailing line that had no terminator.
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.take_line(&mut lines);
        lines.pop()
    }

    fn take_line(&mut self, lines: &mut Vec<String>) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        lines.push(line);
    }
}

/// Spawn a thread forwarding a pipe's lines into `tx`.
fn spawn_reader<R>(
    mut pipe: R,
    stream: Stream,
    tx: mpsc::Sender<(Stream, String)>,
) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut splitter = LineSplitter::new();
        let mut buf = [0u8; 1024];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for line in splitter.push(&buf[..n]) {
                        if tx.send((stream, line)).is_err() {
                            return;
                        }
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
                Err(e) => {
                    debug!("{stream:?} pipe closed: {e}");
                    break;
                },
            }
        }
        if let Some(line) = splitter.finish() {
            let _ = tx.send((stream, line));
        }
    })
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("Failed to kill esptool: {e}");
    }
    let _ = child.wait();
}

/// Run esptool, calling `on_line` for every output line in arrival order.
///
/// `on_line` runs on the calling thread. The child is killed when `timeout`
/// elapses or the interrupt checker fires.
pub fn run<F>(command: &EsptoolCommand, timeout: Option<Duration>, mut on_line: F) -> Result<()>
where
    F: FnMut(Stream, &str),
{
    info!("Running {}", command.display());
    let mut child = command.to_command().spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::ToolNotFound {
                tried: command.program.display().to_string(),
            }
        } else {
            Error::Io(e)
        }
    })?;

    let (tx, rx) = mpsc::channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Stream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Stream::Stderr, tx.clone()));
    }
    drop(tx);

    let started = Instant::now();
    // esptool prints fatal errors on stdout, so both streams feed the tail.
    let mut output_tail: VecDeque<String> = VecDeque::with_capacity(ERROR_TAIL_LINES);

    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok((stream, line)) => {
                trace!("esptool {stream:?}: {line}");
                if output_tail.len() == ERROR_TAIL_LINES {
                    output_tail.pop_front();
                }
                output_tail.push_back(line.clone());
                on_line(stream, &line);
            },
            Err(mpsc::RecvTimeoutError::Timeout) => {},
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if crate::is_interrupted_requested() {
            warn!("Interrupted, stopping esptool");
            kill(&mut child);
            return Err(Error::Interrupted);
        }
        if let Some(limit) = timeout {
            if started.elapsed() > limit {
                warn!("esptool exceeded {}s, stopping it", limit.as_secs());
                kill(&mut child);
                return Err(Error::Timeout(format!(
                    "esptool did not finish within {}s",
                    limit.as_secs()
                )));
            }
        }
    }

    for reader in readers {
        let _ = reader.join();
    }
    let status = child.wait()?;
    debug!("esptool exited with {status}");

    if status.success() {
        Ok(())
    } else {
        Err(Error::ToolFailed {
            code: status.code(),
            output: Vec::from(output_tail).join("\n"),
        })
    }
}
