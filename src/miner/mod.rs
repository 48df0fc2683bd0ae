// src/miner/mod.rs
//! Core mining functionality
//!
//! This module contains all components related to the hashing side:
//! - The proof-of-work algorithm seam
//! - Work templates, shares and the nonce partitioning
//! - The worker pool and its hashing threads

/// Mining algorithm implementations
///
/// Contains the [`Algorithm`] trait and the Blake2s-256 implementation.
pub mod algorithm;

/// Work templates, shares and worker events
pub mod template;

/// Worker pool
///
/// Publishes the current template, partitions the nonce space, supervises
/// workers and delivers shares and hashrate.
pub mod scheduler;

/// Worker thread implementation
///
/// Contains the worker thread logic that performs actual hash computations.
pub mod worker;

// Re-export main components for cleaner imports
pub use self::algorithm::{Algorithm, Blake2sAlgo};
pub use self::scheduler::{PoolSettings, WorkerPool};
pub use self::template::{HashSample, Share, WorkTemplate};
pub use self::worker::HashWorker;
