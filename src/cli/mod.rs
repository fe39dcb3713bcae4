//! Command-line interface definitions and helpers.
//!
//! This module contains all CLI argument parsing, enums, and subcommand handlers.

mod args;
mod commands;
mod enums;

pub use args::{Args, Command, ConfigAction, RunArgs};
pub use commands::{handle_config_action, list_devices, run};
pub use enums::{Format, Tier};
