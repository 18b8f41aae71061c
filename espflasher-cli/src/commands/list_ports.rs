//! List-ports command implementation.

use anyhow::{Context, Result};
use console::style;
use espflasher::{PortGuesser, SerialPortDescriptor};

use crate::config::Config;

fn ports_json(ports: &[SerialPortDescriptor], guesser: &PortGuesser) -> serde_json::Value {
    let guessed = guesser.select(ports);
    let entries: Vec<serde_json::Value> = ports
        .iter()
        .map(|p| {
            serde_json::json!({
                "device": p.device,
                "description": p.description,
                "recognised": guesser.is_recognised(p),
                "guessed": guessed.as_deref() == Some(p.device.as_str()),
            })
        })
        .collect();
    serde_json::Value::Array(entries)
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(config: &Config, json: bool) -> Result<()> {
    let detected = espflasher::detect_ports();
    let guesser = config.port_guesser();

    if json {
        let value = ports_json(&detected, &guesser);
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("Failed to encode port list")?
        );
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("(none found)").dim());
        return Ok(());
    }

    for port in &detected {
        let marker = if guesser.is_recognised(port) {
            style("•").green()
        } else {
            style("•").dim()
        };
        if port.description.is_empty() {
            eprintln!("  {marker} {}", style(&port.device).cyan());
        } else {
            eprintln!(
                "  {marker} {} - {}",
                style(&port.device).cyan(),
                style(&port.description).dim()
            );
        }
    }

    if let Some(guessed) = guesser.select(&detected) {
        eprintln!(
            "\n{} Guessed board port: {}",
            style("→").green().bold(),
            style(guessed).cyan().bold()
        );
    }

    Ok(())
}
