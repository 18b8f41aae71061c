//! Serial monitor command implementation.
//!
//! One reader thread moves serial data into a [`LogBuffer`] and prints the
//! completed lines; the main thread waits for Ctrl-C.

use anyhow::{Context, Result};
use console::style;
use espflasher::{LogBuffer, MonitorSession, timestamp_prefix};
use std::fs::File;
use std::io::{self, Read as _, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, clear_interrupted_flag, get_port, was_interrupted};

/// Baud rate used when neither the command line nor the config sets one.
pub(crate) const DEFAULT_MONITOR_BAUD: u32 = 115_200;

/// Monitor settings from the command line.
#[derive(Debug, Clone, Default)]
pub(crate) struct MonitorOptions {
    pub(crate) baud: Option<u32>,
    pub(crate) timestamp: bool,
    pub(crate) log_file: Option<PathBuf>,
    pub(crate) reset: bool,
}

/// Render one completed line for the terminal.
fn format_line(line: &str, timestamp: bool) -> String {
    if timestamp {
        format!("{}{line}", timestamp_prefix())
    } else {
        line.to_string()
    }
}

/// Feed `chunk` through `buffer` and write the completed lines.
fn emit_chunk(
    buffer: &mut LogBuffer,
    chunk: &[u8],
    timestamp: bool,
    out: &mut impl io::Write,
    log: Option<&mut File>,
) -> io::Result<()> {
    let lines = buffer.push(chunk);
    if lines.is_empty() {
        return Ok(());
    }
    for line in &lines {
        writeln!(out, "{}", format_line(line, timestamp))?;
    }
    out.flush()?;

    if let Some(log) = log {
        for line in &lines {
            writeln!(log, "{line}")?;
        }
    }
    Ok(())
}

/// Run the serial monitor until Ctrl-C.
pub(crate) fn cmd_monitor(
    cli: &Cli,
    config: &mut Config,
    port_override: Option<&str>,
    options: &MonitorOptions,
) -> Result<()> {
    let port_name = if let Some(port) = port_override {
        port.to_string()
    } else {
        get_port(cli, config)?
    };
    let baud = options
        .baud
        .or(config.monitor.baud)
        .unwrap_or(DEFAULT_MONITOR_BAUD);
    let timestamp = options.timestamp || config.monitor.timestamp;

    if !cli.quiet {
        eprintln!(
            "{} Monitoring {} at {baud} baud",
            style("📡").cyan(),
            style(&port_name).green()
        );
        eprintln!("{}", style("Press Ctrl-C to exit").dim());
    }

    let mut session = MonitorSession::open(&port_name, baud)
        .with_context(|| format!("Failed to open {port_name}"))?;

    let mut log_file = match &options.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            if !cli.quiet {
                eprintln!(
                    "{} Logging to {}",
                    style("📝").cyan(),
                    path.display()
                );
            }
            Some(file)
        },
        None => None,
    };

    if options.reset {
        session.pulse_reset().context("Failed to reset the board")?;
    }

    let mut reader = session
        .try_clone_reader()
        .context("Failed to clone serial handle")?;

    let running = Arc::new(AtomicBool::new(true));
    let running_reader = Arc::clone(&running);

    let reader_handle = std::thread::spawn(move || -> io::Result<()> {
        let mut buffer = LogBuffer::default();
        let mut buf = [0u8; 1024];
        let stdout = io::stdout();

        let result = loop {
            if !running_reader.load(Ordering::Relaxed) {
                break Ok(());
            }
            match reader.read(&mut buf) {
                Ok(0) => {},
                Ok(n) => {
                    let mut out = stdout.lock();
                    let written = emit_chunk(
                        &mut buffer,
                        &buf[..n],
                        timestamp,
                        &mut out,
                        log_file.as_mut(),
                    );
                    if let Err(e) = written {
                        break Err(e);
                    }
                },
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {},
                Err(e) => break Err(e),
            }
        };

        // Whatever is left without a line ending still belongs on screen.
        let rest = buffer.push(b"\n");
        if let Some(line) = rest.first().filter(|l| !l.is_empty()) {
            println!("{}", format_line(line, timestamp));
        }
        running_reader.store(false, Ordering::Relaxed);
        result
    });

    while running.load(Ordering::Relaxed) {
        if was_interrupted() {
            running.store(false, Ordering::Relaxed);
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    let reader_result = reader_handle
        .join()
        .map_err(|_| anyhow::anyhow!("Monitor reader thread panicked"))?;
    drop(session);
    clear_interrupted_flag();

    reader_result.with_context(|| format!("Lost connection to {port_name}"))?;

    if !cli.quiet {
        eprintln!("\n{} Monitor closed", style("✓").green());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line_plain() {
        assert_eq!(format_line("I (31) boot", false), "I (31) boot");
    }

    #[test]
    fn test_format_line_timestamp() {
        let line = format_line("I (31) boot", true);
        assert!(line.starts_with('['));
        assert!(line.ends_with("] I (31) boot"));
    }

    #[test]
    fn test_emit_chunk_writes_complete_lines_only() {
        let mut buffer = LogBuffer::default();
        let mut out = Vec::new();
        emit_chunk(&mut buffer, b"ets Jun  8 2016\r\nrst:0x1", false, &mut out, None).unwrap();
        assert_eq!(String::from_utf8(out.clone()).unwrap(), "ets Jun  8 2016\n");

        emit_chunk(&mut buffer, b" (POWERON_RESET)\n", false, &mut out, None).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "ets Jun  8 2016\nrst:0x1 (POWERON_RESET)\n"
        );
    }

    #[test]
    fn test_emit_chunk_appends_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.log");
        let mut file = File::create(&path).unwrap();
        let mut buffer = LogBuffer::default();
        let mut out = Vec::new();

        emit_chunk(&mut buffer, b"one\ntwo\n", true, &mut out, Some(&mut file)).unwrap();
        drop(file);

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
        let shown = String::from_utf8(out).unwrap();
        assert_eq!(shown.lines().count(), 2);
        assert!(shown.lines().all(|l| l.starts_with('[')));
    }
}
