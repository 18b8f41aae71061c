//! Flash command implementation.

use anyhow::{Context, Result};
use console::style;
use espflasher::archive::DEFAULT_SINGLE_OFFSET;
use espflasher::{EsptoolCommand, FirmwareOptions, FlashProgressTracker, ResetMode, Stream};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, get_port, use_fancy_output};

/// Parse a reset mode name as esptool spells it.
fn parse_reset_mode(name: &str) -> Result<ResetMode> {
    match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "default_reset" | "hard_reset" | "default" => Ok(ResetMode::Default),
        "no_reset" => Ok(ResetMode::NoReset),
        other => Err(CliError::Usage(format!(
            "unknown reset mode {other:?} (expected default_reset, hard_reset or no_reset)"
        ))
        .into()),
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Build the esptool invocation for `firmware`.
fn build_command(
    cli: &Cli,
    config: &Config,
    images: Vec<espflasher::FlashImage>,
    port: &str,
    program: PathBuf,
) -> Result<EsptoolCommand> {
    let mut cmd = EsptoolCommand::new(program, cli.chip(config), port, cli.baud(config), images);
    if let Some(before) = &config.flash.before {
        cmd.before = parse_reset_mode(before)?;
    }
    if let Some(after) = &config.flash.after {
        cmd.after = parse_reset_mode(after)?;
    }
    Ok(cmd)
}

/// Flash command implementation. Returns the port that was used.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &mut Config,
    firmware: &Path,
    dry_run: bool,
) -> Result<String> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            firmware.display()
        );
    }

    let opts = FirmwareOptions {
        single_offset: config
            .flash
            .single_offset
            .unwrap_or(DEFAULT_SINGLE_OFFSET),
        extract_dir: None,
    };
    let bundle = espflasher::prepare_firmware(firmware, &opts)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Found {} image(s)",
            style("ℹ").blue(),
            bundle.images.len()
        );
        for image in &bundle.images {
            eprintln!(
                "    {} 0x{:06X}  {}",
                style("•").dim(),
                image.offset,
                image.path.display()
            );
        }
    }

    let port = get_port(cli, config)?;

    let explicit = cli.esptool(config);
    let program = if dry_run {
        explicit.unwrap_or_else(|| PathBuf::from(espflasher::esptool::ESPTOOL_CANDIDATES[0]))
    } else {
        espflasher::find_esptool(explicit.as_deref())
            .context("Install esptool (pip install esptool) or pass --esptool")?
    };

    let cmd = build_command(cli, config, bundle.images, &port, program)?;

    if dry_run {
        println!("{}", cmd.display());
        return Ok(port);
    }

    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            style(&port).green(),
            cmd.baud
        );
    }

    let pb = progress_bar(cli.quiet);
    pb.set_message("flashing");
    let mut tracker = FlashProgressTracker::new();
    let mut last_logged = 0u8;
    let timeout = config.flash.timeout_secs.map(Duration::from_secs);

    let result = espflasher::esptool::run(&cmd, timeout, |stream, line| {
        tracker.observe(line);
        let percent = tracker.percent();
        pb.set_position(u64::from(percent));

        if pb.is_hidden() {
            // Without a bar, report in steps of ten.
            if percent / 10 > last_logged / 10 {
                info!("Flashing: {percent}%");
            }
            if stream == Stream::Stderr {
                debug!("esptool: {line}");
            }
        }
        last_logged = percent;
    });

    match result {
        Ok(()) => {},
        Err(espflasher::Error::Interrupted) => {
            pb.abandon_with_message("cancelled");
            return Err(CliError::Cancelled("Flashing interrupted".to_string()).into());
        },
        Err(e) => {
            pb.abandon_with_message("failed");
            return Err(e).with_context(|| format!("Flashing via {port} failed"));
        },
    }

    pb.finish_with_message("done");
    if tracker.percent() < 100 {
        warn!(
            "esptool exited successfully but reported {}% progress",
            tracker.percent()
        );
    }

    if !cli.quiet {
        eprintln!(
            "\n{} Flashed {} segment(s), {} bytes",
            style("🎉").green().bold(),
            tracker.segments(),
            tracker.total_size_bytes()
        );
    }

    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use espflasher::FlashImage;

    #[test]
    fn test_parse_reset_mode() {
        assert_eq!(parse_reset_mode("default_reset").unwrap(), ResetMode::Default);
        assert_eq!(parse_reset_mode("hard_reset").unwrap(), ResetMode::Default);
        assert_eq!(parse_reset_mode("No-Reset").unwrap(), ResetMode::NoReset);
    }

    #[test]
    fn test_parse_reset_mode_unknown_is_usage_error() {
        let err = parse_reset_mode("soft_reset").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_build_command_uses_config() {
        let cli = Cli::try_parse_from(["espflasher", "flash", "fw.bin"]).unwrap();
        let mut config = Config::default();
        config.flash.chip = Some("esp32s3".to_string());
        config.flash.after = Some("no_reset".to_string());
        config.connection.baud = Some(115_200);

        let images = vec![FlashImage {
            offset: 0x1000,
            path: PathBuf::from("fw.bin"),
        }];
        let cmd = build_command(&cli, &config, images, "/dev/ttyUSB0", "esptool".into()).unwrap();

        assert_eq!(cmd.chip, "esp32s3");
        assert_eq!(cmd.baud, 115_200);
        assert_eq!(cmd.before, ResetMode::Default);
        assert_eq!(cmd.after, ResetMode::NoReset);
        let line = cmd.display();
        assert!(line.starts_with("esptool --chip esp32s3 --port /dev/ttyUSB0"));
        assert!(line.ends_with("write_flash -z 0x1000 fw.bin"));
    }
}
