//! Extract command: unpack a release archive and show its flash layout.

use anyhow::{Context, Result};
use console::style;
use espflasher::FirmwareBundle;
use espflasher::archive::{DEFAULT_SINGLE_OFFSET, default_extract_dir, layout_from_files};
use std::path::Path;

use crate::Cli;
use crate::config::Config;

fn layout_json(bundle: &FirmwareBundle, files: usize) -> serde_json::Value {
    let images: Vec<serde_json::Value> = bundle
        .images
        .iter()
        .map(|img| {
            serde_json::json!({
                "offset": format!("0x{:X}", img.offset),
                "path": img.path.display().to_string(),
            })
        })
        .collect();
    serde_json::json!({
        "root": bundle.root.display().to_string(),
        "files": files,
        "images": images,
    })
}

/// Extract command implementation.
pub(crate) fn cmd_extract(
    cli: &Cli,
    config: &Config,
    archive: &Path,
    out: Option<&Path>,
    json: bool,
) -> Result<()> {
    let dest = out.map_or_else(|| default_extract_dir(archive), Path::to_path_buf);

    let files = espflasher::extract_zip(archive, &dest)
        .with_context(|| format!("Failed to extract {}", archive.display()))?;
    let single_offset = config
        .flash
        .single_offset
        .unwrap_or(DEFAULT_SINGLE_OFFSET);
    // Only this archive's files; `dest` may already hold another release.
    let bundle = layout_from_files(&dest, &files, single_offset)
        .with_context(|| format!("No flash layout in {}", dest.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&layout_json(&bundle, files.len()))
                .context("Failed to encode layout")?
        );
        return Ok(());
    }

    if !cli.quiet {
        eprintln!(
            "{} Extracted {} file(s) to {}",
            style("✓").green(),
            files.len(),
            style(dest.display()).yellow()
        );
    }
    eprintln!("\n{}", style("Flash layout").bold().underlined());
    for image in &bundle.images {
        eprintln!(
            "  {} 0x{:06X}  {}",
            style("•").green(),
            image.offset,
            image.path.display()
        );
    }

    Ok(())
}
