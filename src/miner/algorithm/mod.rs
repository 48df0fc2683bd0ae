// src/miner/algorithm/mod.rs
//! Proof-of-work hash implementations
//!
//! The miner never hashes directly; workers go through the [`Algorithm`] trait
//! so the hash function stays a pluggable collaborator.

/// Blake2s-256 implementation
pub mod blake2s;

use crate::utils::error::MinerError;

pub use blake2s::Blake2sAlgo;

/// Common interface for all mining algorithms
///
/// All mining algorithm implementations must provide these basic operations
/// to be compatible with the worker pool.
pub trait Algorithm: Send + Sync {
    /// Compute the hash for given input data and nonce
    ///
    /// # Arguments
    /// * `input` - The block header or other data to be hashed
    /// * `nonce` - The nonce value to use in the hash computation
    ///
    /// # Returns
    /// 32-byte hash result or error if computation fails
    fn hash(&self, input: &[u8], nonce: u64) -> Result<[u8; 32], MinerError>;

    /// Verify if a hash meets the target difficulty
    ///
    /// # Returns
    /// `true` if hash is valid (less than target), `false` otherwise
    fn verify(&self, input: &[u8], nonce: u64, target: &[u8]) -> Result<bool, MinerError> {
        let hash = self.hash(input, nonce)?;
        Ok(hash.as_slice() < target)
    }

    /// Short name used in logs
    fn name(&self) -> &'static str;
}
