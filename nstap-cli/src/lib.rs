//! CLI interface for nstap
//!
//! This crate provides the `nstap` command-line front end: listing and
//! cleaning up persisted networks, host-side captures and a standalone
//! trace collector.

pub mod args;
pub mod commands;

pub use args::{Cli, Commands};
pub use commands::run;
