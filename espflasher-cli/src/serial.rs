//! Serial port selection.
//!
//! Resolution order:
//! - `--port` / `ESPFLASHER_PORT`
//! - `[connection] port` from the config
//! - the port guesser over the currently attached ports
//! - `--wait`: keep polling until a recognised board shows up
//! - an interactive prompt (TTY only, never with `--non-interactive`)

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    espflasher::{PortGuesser, SerialPortDescriptor, detect_ports, wait_for_port},
    log::{debug, error, info},
    std::{io::IsTerminal, time::Duration},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Fail instead of prompting.
    pub non_interactive: bool,
    /// Poll for a recognised board this long before giving up.
    pub wait: Option<Duration>,
}

/// The chosen port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedPort {
    /// Device path.
    pub device: String,
    /// Whether the user picked it from a prompt.
    pub prompted: bool,
}

impl SelectedPort {
    fn resolved(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            prompted: false,
        }
    }
}

fn usage_err(message: &str) -> anyhow::Error {
    // Setup problems map to exit code 2 so scripts can tell them apart from
    // flashing failures.
    CliError::Usage(message.to_string()).into()
}

/// Pick a port without prompting, or `None` when nothing fits.
fn resolve_port(
    options: &SerialOptions,
    config: &Config,
    guesser: &PortGuesser,
    ports: &[SerialPortDescriptor],
) -> Option<SelectedPort> {
    if let Some(port) = &options.port {
        return Some(SelectedPort::resolved(port.clone()));
    }

    if let Some(port) = &config.connection.port {
        debug!("Using port from config: {port}");
        return Some(SelectedPort::resolved(port.clone()));
    }

    guesser.select(ports).map(|device| {
        let description = ports
            .iter()
            .find(|p| p.device == device)
            .map(|p| p.description.as_str())
            .unwrap_or_default();
        info!("Auto-selected port: {device} [{description}]");
        SelectedPort::resolved(device)
    })
}

fn no_recognised_port_err(ports: &[SerialPortDescriptor]) -> anyhow::Error {
    if ports.is_empty() {
        usage_err("No serial ports found. Connect the board or pass --port")
    } else {
        usage_err(&format!(
            "No recognised USB-UART bridge among {} port(s). Pass --port to choose one",
            ports.len()
        ))
    }
}

/// Select a serial port automatically or interactively.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    let guesser = config.port_guesser();
    let ports = detect_ports();

    if let Some(selected) = resolve_port(options, config, &guesser, &ports) {
        return Ok(selected);
    }

    if let Some(timeout) = options.wait {
        eprintln!(
            "{} Waiting up to {}s for a board...",
            style("⏳").yellow(),
            timeout.as_secs()
        );
        return match wait_for_port(&guesser, timeout) {
            Ok(device) => Ok(SelectedPort::resolved(device)),
            Err(espflasher::Error::Interrupted) => {
                Err(CliError::Cancelled("Waiting for a board was cancelled".to_string()).into())
            },
            Err(espflasher::Error::DeviceNotFound) => Err(usage_err(&format!(
                "No recognised board appeared within {}s",
                timeout.as_secs()
            ))),
            Err(e) => Err(e.into()),
        };
    }

    if options.non_interactive || ports.is_empty() {
        return Err(no_recognised_port_err(&ports));
    }

    ensure_interactive_terminal()?;
    select_port_interactive(&ports)
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal. Pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Port selection cancelled".to_string()).into()
            } else {
                usage_err("Port selection prompt failed")
            }
        },
    }
}

/// Prompt label for one port.
fn port_label(port: &SerialPortDescriptor) -> String {
    if port.description.is_empty() {
        port.device.clone()
    } else {
        format!("{} - {}", port.device, style(&port.description).dim())
    }
}

fn select_port_interactive(ports: &[SerialPortDescriptor]) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial port(s), none of them a recognised bridge",
        style("ℹ").blue(),
        ports.len()
    );

    // Keep labels on one line in narrow terminals.
    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&port_label(p), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the board's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .get(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            Ok(SelectedPort {
                device: port.device.clone(),
                prompted: true,
            })
        },
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}

/// Offer to save a prompted port to the local config.
pub fn ask_remember_port(device: &str, config: &mut Config) -> Result<()> {
    if config.connection.port.as_deref() == Some(device) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {device} for this project?"))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_port(device) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports() -> Vec<SerialPortDescriptor> {
        vec![
            SerialPortDescriptor::new("/dev/ttyS0", ""),
            SerialPortDescriptor::new("/dev/ttyUSB0", "FT232R USB UART [0403:6001]"),
            SerialPortDescriptor::new("/dev/ttyUSB1", "CP2102 USB to UART Bridge Controller"),
        ]
    }

    #[test]
    fn test_serial_options_default() {
        let options = SerialOptions::default();
        assert!(options.port.is_none());
        assert!(!options.non_interactive);
        assert!(options.wait.is_none());
    }

    #[test]
    fn test_explicit_port_wins() {
        let mut config = Config::default();
        config.connection.port = Some("/dev/ttyACM9".to_string());
        let options = SerialOptions {
            port: Some("COM3".to_string()),
            ..Default::default()
        };
        let selected = resolve_port(&options, &config, &PortGuesser::default(), &ports());
        assert_eq!(selected, Some(SelectedPort::resolved("COM3")));
    }

    #[test]
    fn test_config_port_beats_guess() {
        let mut config = Config::default();
        config.connection.port = Some("/dev/ttyACM9".to_string());
        let selected = resolve_port(
            &SerialOptions::default(),
            &config,
            &PortGuesser::default(),
            &ports(),
        );
        assert_eq!(selected.map(|s| s.device).as_deref(), Some("/dev/ttyACM9"));
    }

    #[test]
    fn test_guess_prefers_priority_bridge() {
        let selected = resolve_port(
            &SerialOptions::default(),
            &Config::default(),
            &PortGuesser::default(),
            &ports(),
        )
        .unwrap();
        assert_eq!(selected.device, "/dev/ttyUSB1");
        assert!(!selected.prompted);
    }

    #[test]
    fn test_no_guess_without_recognised_bridge() {
        let ports = vec![SerialPortDescriptor::new("/dev/ttyS0", "")];
        let selected = resolve_port(
            &SerialOptions::default(),
            &Config::default(),
            &PortGuesser::default(),
            &ports,
        );
        assert!(selected.is_none());
    }

    #[test]
    fn test_no_recognised_port_is_usage_error() {
        for ports in [Vec::new(), ports()] {
            let err = no_recognised_port_err(&ports);
            assert!(matches!(
                err.downcast_ref::<CliError>(),
                Some(CliError::Usage(_))
            ));
        }
    }

    #[test]
    fn test_port_label_without_description() {
        let port = SerialPortDescriptor::new("COM4", "");
        assert_eq!(port_label(&port), "COM4");
    }

    #[test]
    fn test_port_label_fits_after_truncation() {
        let port = SerialPortDescriptor::new(
            "/dev/verylongttyusb0",
            "Very Long Product Name That Would Wrap",
        );
        let truncated = console::truncate_str(&port_label(&port), 26, "\u{2026}").into_owned();
        assert!(console::measure_text_width(&truncated) <= 26);
        assert!(console::strip_ansi_codes(&truncated).starts_with("/dev/verylong"));
    }
}
