//! Configuration file support for espflasher.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ESPFLASHER_*)
//! 3. Local config file (./espflasher.toml)
//! 4. Global config file (~/.config/espflasher/config.toml)
//!
//! `--config PATH` replaces both files.

use directories::ProjectDirs;
use espflasher::PortGuesser;
use espflasher::port_guess::{PRIORITY_IDENTIFIERS, SECONDARY_IDENTIFIERS};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-project config file.
pub const LOCAL_CONFIG_FILE: &str = "espflasher.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Default flashing baud rate.
    pub baud: Option<u32>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Chip passed to esptool.
    pub chip: Option<String>,
    /// esptool executable.
    pub esptool: Option<PathBuf>,
    /// Offset for a bare `.bin` image.
    pub single_offset: Option<u32>,
    /// Abort esptool after this many seconds.
    pub timeout_secs: Option<u64>,
    /// Reset mode before flashing (`default_reset` or `no_reset`).
    pub before: Option<String>,
    /// Reset mode after flashing (`hard_reset` or `no_reset`).
    pub after: Option<String>,
}

/// Monitor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Monitor baud rate.
    pub baud: Option<u32>,
    /// Prefix lines with timestamps.
    #[serde(default)]
    pub timestamp: bool,
}

/// Port guessing configuration. Empty lists keep the built-in tiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Identifiers matched first.
    #[serde(default)]
    pub priority: Vec<String>,
    /// Identifiers matched when no priority identifier matches.
    #[serde(default)]
    pub secondary: Vec<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Monitor configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Port guessing configuration.
    #[serde(default)]
    pub port: PortConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "espflasher").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }

        let flash = other.flash;
        if flash.chip.is_some() {
            self.flash.chip = flash.chip;
        }
        if flash.esptool.is_some() {
            self.flash.esptool = flash.esptool;
        }
        if flash.single_offset.is_some() {
            self.flash.single_offset = flash.single_offset;
        }
        if flash.timeout_secs.is_some() {
            self.flash.timeout_secs = flash.timeout_secs;
        }
        if flash.before.is_some() {
            self.flash.before = flash.before;
        }
        if flash.after.is_some() {
            self.flash.after = flash.after;
        }

        if other.monitor.baud.is_some() {
            self.monitor.baud = other.monitor.baud;
        }
        if other.monitor.timestamp {
            self.monitor.timestamp = true;
        }

        // Tiers replace rather than extend so a local file can narrow them.
        if !other.port.priority.is_empty() {
            self.port.priority = other.port.priority;
        }
        if !other.port.secondary.is_empty() {
            self.port.secondary = other.port.secondary;
        }
    }

    /// Port guesser for the configured tiers.
    pub fn port_guesser(&self) -> PortGuesser {
        let priority: Vec<&str> = if self.port.priority.is_empty() {
            PRIORITY_IDENTIFIERS.to_vec()
        } else {
            self.port.priority.iter().map(String::as_str).collect()
        };
        let secondary: Vec<&str> = if self.port.secondary.is_empty() {
            SECONDARY_IDENTIFIERS.to_vec()
        } else {
            self.port.secondary.iter().map(String::as_str).collect()
        };
        PortGuesser::new(&priority, &secondary)
    }

    /// Remember `port` in the local config file.
    ///
    /// Other settings already in the file are preserved.
    pub fn remember_port(&mut self, port: &str) -> anyhow::Result<PathBuf> {
        self.remember_port_in(Path::new(LOCAL_CONFIG_FILE), port)
    }

    fn remember_port_in(&mut self, path: &Path, port: &str) -> anyhow::Result<PathBuf> {
        let mut file_config = Self::load_from_file(path).unwrap_or_default();
        file_config.connection.port = Some(port.to_string());

        let content = toml::to_string_pretty(&file_config)?;
        fs::write(path, content)?;
        info!("Saved port {port} to {}", path.display());

        self.connection.port = Some(port.to_string());
        Ok(path.to_path_buf())
    }
}
