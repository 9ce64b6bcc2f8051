//! Command-line interface for reelforge.
//!
//! Provides commands for shot planning, continuity validation and operating
//! on persisted runs (status, review decisions, cancellation, budget).

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
