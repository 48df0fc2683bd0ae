// src/cli/mod.rs
//! Command line interface: `start`, `benchmark` and `config`

/// Argument definitions and configuration overrides
pub mod commands;

pub use commands::{Action, BenchmarkOptions, Commands, ConfigOptions, StartOptions};
