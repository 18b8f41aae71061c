//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::Cli;

const BIN_NAME: &str = "espflasher";

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN_NAME, &mut io::stdout());
}

/// Map a `$SHELL` value such as `/usr/bin/zsh` to a [`Shell`].
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let name = Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }
    None
}

fn home_dir() -> Result<PathBuf> {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .context("Could not determine home directory")
}

fn xdg_dir(var: &str, fallback: &[&str]) -> Result<PathBuf> {
    if let Ok(dir) = env::var(var) {
        return Ok(PathBuf::from(dir));
    }
    Ok(fallback
        .iter()
        .fold(home_dir()?, |path, part| path.join(part)))
}

/// Where the completion script for `shell` goes.
fn completion_install_path(shell: Shell) -> Result<PathBuf> {
    match shell {
        Shell::Bash => Ok(xdg_dir("XDG_DATA_HOME", &[".local", "share"])?
            .join("bash-completion")
            .join("completions")
            .join(BIN_NAME)),
        Shell::Zsh => Ok(home_dir()?.join(".zfunc").join(format!("_{BIN_NAME}"))),
        Shell::Fish => Ok(xdg_dir("XDG_CONFIG_HOME", &[".config"])?
            .join("fish")
            .join("completions")
            .join(format!("{BIN_NAME}.fish"))),
        Shell::Elvish => Ok(xdg_dir("XDG_CONFIG_HOME", &[".config"])?
            .join("elvish")
            .join("lib")
            .join(format!("{BIN_NAME}.elv"))),
        Shell::PowerShell => Ok(home_dir()?
            .join(".config")
            .join("powershell")
            .join("completions")
            .join(format!("{BIN_NAME}.ps1"))),
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    }
}

/// Install shell completions for the given or detected shell.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             espflasher completions --install bash",
        )?,
    };

    let path = completion_install_path(shell)?;

    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), BIN_NAME, &mut buf);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓").green().bold(),
        style(format!("{shell:?}")).cyan(),
        style(path.display()).yellow()
    );

    match shell {
        Shell::Zsh => {
            eprintln!(
                "Make sure {} is in your .zshrc, then run {}",
                style("fpath=(~/.zfunc $fpath)").cyan(),
                style("exec zsh").cyan()
            );
        },
        Shell::PowerShell => {
            eprintln!(
                "Load it from your profile with {}",
                style(format!(". {}", path.display())).cyan()
            );
        },
        _ => eprintln!("Completions load automatically in new shells."),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_from_path() {
        assert_eq!(shell_from_path("/bin/bash"), Some(Shell::Bash));
        assert_eq!(shell_from_path("/usr/bin/zsh"), Some(Shell::Zsh));
        assert_eq!(shell_from_path("fish"), Some(Shell::Fish));
        assert_eq!(shell_from_path("/usr/bin/pwsh"), Some(Shell::PowerShell));
        assert_eq!(shell_from_path("/usr/bin/tcsh"), None);
        assert_eq!(shell_from_path(""), None);
    }

    #[test]
    fn test_install_paths_named_after_binary() {
        if home_dir().is_err() {
            return;
        }
        let bash = completion_install_path(Shell::Bash).unwrap();
        assert!(bash.ends_with("bash-completion/completions/espflasher"));
        let zsh = completion_install_path(Shell::Zsh).unwrap();
        assert!(zsh.ends_with(".zfunc/_espflasher"));
        let fish = completion_install_path(Shell::Fish).unwrap();
        assert!(fish.ends_with("fish/completions/espflasher.fish"));
    }

    #[test]
    fn test_generated_scripts_mention_binary() {
        for shell in [Shell::Bash, Shell::Zsh, Shell::Fish] {
            let mut buf = Vec::new();
            generate(shell, &mut Cli::command(), BIN_NAME, &mut buf);
            let script = String::from_utf8(buf).unwrap();
            assert!(script.contains("espflasher"), "{shell:?}");
            assert!(script.contains("list-ports"), "{shell:?}");
        }
    }
}
