// src/miner/algorithm/blake2s.rs
//! Blake2s-256 proof-of-work
//!
//! Hashes `header ∥ nonce` where the nonce is appended as 8 little-endian bytes.

use crate::miner::algorithm::Algorithm;
use crate::utils::error::MinerError;
use blake2::{Blake2s256, Digest};

/// Stateless Blake2s-256 hasher
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake2sAlgo;

impl Blake2sAlgo {
    /// Creates the algorithm
    pub fn new() -> Self {
        Self
    }
}

impl Algorithm for Blake2sAlgo {
    fn hash(&self, input: &[u8], nonce: u64) -> Result<[u8; 32], MinerError> {
        let mut hasher = Blake2s256::new();
        hasher.update(input);
        hasher.update(nonce.to_le_bytes());
        Ok(hasher.finalize().into())
    }

    fn name(&self) -> &'static str {
        "blake2s"
    }
}
