//! Command-line interface for the plan/apply workflow.
//!
//! Flags, environment variables and `.env` values are resolved here; the rest
//! of the crate only sees [`crate::config::Settings`] and executor options.

mod commands;
mod output;

pub use commands::{parse_args, Cli, Commands, OutputFormat, ProviderKind};
pub use output::{write_block, OutputFormatter};
