// src/utils/mod.rs
//! Error type and logging setup shared by every module

/// [`MinerError`] and its conversions
pub mod error;

/// `env_logger` initialization for the `start` and `benchmark` commands
pub mod logging;

pub use error::MinerError;
pub use logging::{init_bench_logging, init_logging};
