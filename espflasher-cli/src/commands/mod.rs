//! Command implementations.
//!
//! Each subcommand is implemented in its own module.

pub(crate) mod completions;
pub(crate) mod extract;
pub(crate) mod flash;
pub(crate) mod list_ports;
pub(crate) mod monitor;
