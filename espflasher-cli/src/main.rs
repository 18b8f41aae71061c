//! espflasher CLI - flash ESP32 firmware archives through esptool.
//!
//! ## Features
//!
//! - Flash `.zip` release archives, extracted directories or single `.bin` images
//! - Live percentage estimated from esptool's own output
//! - Serial port guessing for common USB-UART bridges
//! - Serial log monitor with timestamps and log files
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod commands;
mod config;
mod serial;

use commands::monitor::MonitorOptions;
use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Baud rate used when neither the command line nor the config sets one.
pub(crate) const DEFAULT_BAUD: u32 = 460_800;

/// Chip used when neither the command line nor the config sets one.
pub(crate) const DEFAULT_CHIP: &str = "esp32";

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed since the last [`clear_interrupted_flag`].
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

pub(crate) fn clear_interrupted_flag() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Failures that map to a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// The user backed out (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// espflasher - flash ESP32 firmware archives through esptool.
///
/// Environment variables:
///   ESPFLASHER_PORT              - Default serial port
///   ESPFLASHER_BAUD              - Default baud rate (default: 460800)
///   ESPFLASHER_CHIP              - Target chip passed to esptool (default: esp32)
///   ESPFLASHER_ESPTOOL           - Path to the esptool executable
///   ESPFLASHER_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "espflasher")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port to use (guessed if not specified).
    #[arg(short, long, global = true, env = "ESPFLASHER_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate for flashing [default: 460800].
    #[arg(short, long, global = true, env = "ESPFLASHER_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Target chip passed to esptool [default: esp32].
    #[arg(long, global = true, env = "ESPFLASHER_CHIP")]
    pub(crate) chip: Option<String>,

    /// Path to the esptool executable.
    #[arg(long, global = true, env = "ESPFLASHER_ESPTOOL", value_name = "PATH")]
    pub(crate) esptool: Option<PathBuf>,

    /// Wait up to SECS for a recognised board to be plugged in.
    #[arg(long, global = true, value_name = "SECS")]
    pub(crate) wait: Option<u64>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "ESPFLASHER_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    pub(crate) fn baud(&self, config: &Config) -> u32 {
        self.baud
            .or(config.connection.baud)
            .unwrap_or(DEFAULT_BAUD)
    }

    pub(crate) fn chip(&self, config: &Config) -> String {
        self.chip
            .clone()
            .or_else(|| config.flash.chip.clone())
            .unwrap_or_else(|| DEFAULT_CHIP.to_string())
    }

    pub(crate) fn esptool(&self, config: &Config) -> Option<PathBuf> {
        self.esptool
            .clone()
            .or_else(|| config.flash.esptool.clone())
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a firmware archive (.zip), directory or single .bin image.
    Flash {
        /// Firmware to flash.
        firmware: PathBuf,

        /// Open the serial monitor after flashing.
        #[arg(long)]
        monitor: bool,

        /// Print the esptool command instead of running it.
        #[arg(long)]
        dry_run: bool,
    },

    /// List available serial ports and the guessed board.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Open the serial log monitor.
    Monitor {
        /// Baud rate for monitoring [default: 115200].
        #[arg(long)]
        monitor_baud: Option<u32>,

        /// Prefix each line with a timestamp.
        #[arg(long)]
        timestamp: bool,

        /// Append received lines to a file.
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,

        /// Reset the board before reading.
        #[arg(long)]
        reset: bool,
    },

    /// Extract a firmware archive and show the flash layout.
    Extract {
        /// Firmware archive (.zip).
        archive: PathBuf,

        /// Output directory [default: extracted/ next to the archive].
        #[arg(long, value_name = "DIR")]
        out: Option<PathBuf>,

        /// Output layout as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install completions into your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Exit code for a failed run.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    if let Some(espflasher::Error::Interrupted) = err.downcast_ref::<espflasher::Error>() {
        return 130;
    }
    1
}

fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            // Second Ctrl-C: give up on graceful shutdown.
            std::process::exit(130);
        }
    });
    if let Err(e) = result {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    espflasher::set_interrupt_checker(was_interrupted);
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "espflasher v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            firmware,
            monitor,
            dry_run,
        } => {
            let port = commands::flash::cmd_flash(cli, &mut config, firmware, *dry_run)?;
            if *monitor && !*dry_run {
                eprintln!();
                commands::monitor::cmd_monitor(
                    cli,
                    &mut config,
                    Some(&port),
                    &MonitorOptions::default(),
                )?;
            }
        },
        Commands::ListPorts { json } => {
            commands::list_ports::cmd_list_ports(&config, *json)?;
        },
        Commands::Monitor {
            monitor_baud,
            timestamp,
            log_file,
            reset,
        } => {
            let options = MonitorOptions {
                baud: *monitor_baud,
                timestamp: *timestamp,
                log_file: log_file.clone(),
                reset: *reset,
            };
            commands::monitor::cmd_monitor(cli, &mut config, None, &options)?;
        },
        Commands::Extract { archive, out, json } => {
            commands::extract::cmd_extract(cli, &config, archive, out.as_deref(), *json)?;
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)?;
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell, e.g. `espflasher completions bash`, or use --install"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
            }
        },
    }

    Ok(())
}

/// Get serial port from CLI args, config, the guesser or an interactive prompt.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
        wait: cli.wait.map(Duration::from_secs),
    };

    let selected = select_serial_port(&options, config)?;

    if selected.prompted && !cli.non_interactive {
        ask_remember_port(&selected.device, config)?;
    }

    Ok(selected.device)
}
