//! Command-line interface for story-forge.
//!
//! Provides a one-shot `run` command and an interactive `chat` command that
//! keeps a session across turns.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
