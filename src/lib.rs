//! Pool Miner - pool mining client in Rust
//!
//! This crate provides a complete pool mining client with support for:
//! - A reliable pool session with reconnection and backoff
//! - Multi-threaded Blake2s proof-of-work search over partitioned nonce ranges
//! - Consensus-driven start and pause through a node's JSON-RPC interface
//! - Periodic hashrate, balance and mempool reporting
//! - Performance benchmarking

#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Miner core implementation including algorithms and the worker pool
pub mod miner;

/// Network communication components for pool and node connections
pub mod network;

/// Statistics collection and reporting functionality
pub mod stats;

/// Utility functions and error handling
pub mod utils;

/// Command-line interface definitions
pub mod cli;

/// Configuration management
pub mod config;

/// Orchestration of consensus, pool session and workers
pub mod controller;

/// Shared type definitions
pub mod types;

// Core exports
pub use cli::Commands;
pub use config::Config;
pub use controller::{ControllerSettings, MinerController};
pub use miner::{Algorithm, Blake2sAlgo, HashWorker, PoolSettings, Share, WorkTemplate, WorkerPool};
pub use network::{
    ConsensusEvent, Connector, Ledger, MinerIdentity, NodeClient, PoolSession, SessionEvent,
    SessionHandle, SessionState, WsConnector,
};
pub use stats::StatsReporter;
pub use types::{Network, ThreadCount};
pub use utils::{MinerError, init_logging};
