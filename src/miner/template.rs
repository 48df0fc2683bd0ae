// src/miner/template.rs
//! Work and result types exchanged between the pool session and the workers
//!
//! A [`WorkTemplate`] is immutable once received. The worker pool wraps it in a
//! versioned [`Assignment`] that every worker reads to derive its own nonce
//! sub-range, so replacing the template is a single pointer swap.

use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Size of a proof-of-work hash and of the targets it is compared against
pub const HASH_SIZE: usize = 32;

/// Nonce range used when the pool does not assign one
pub const DEFAULT_NONCE_RANGE: Range<u64> = 0..(1u64 << 32);

/// A unit of work issued by the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkTemplate {
    /// Pool-assigned identifier, echoed back with every share
    pub template_id: String,
    /// Opaque header bytes; the nonce is appended before hashing
    pub header: Vec<u8>,
    /// Share threshold: a hash strictly below it is a valid share
    pub target: [u8; HASH_SIZE],
    /// Network threshold: a share below it is also a full block
    pub block_target: Option<[u8; HASH_SIZE]>,
    /// Height of the block being mined
    pub height: u32,
    /// Nonces this miner may search (end exclusive)
    pub nonce_range: Range<u64>,
}

impl WorkTemplate {
    /// Whether `hash` satisfies the share target
    pub fn meets_target(&self, hash: &[u8; HASH_SIZE]) -> bool {
        hash < &self.target
    }

    /// Whether `hash` satisfies the network target as well
    pub fn meets_block_target(&self, hash: &[u8; HASH_SIZE]) -> bool {
        self.block_target.as_ref().is_some_and(|target| hash < target)
    }
}

/// A solution found by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    /// Template the nonce was searched against
    pub template_id: String,
    /// Nonce that produced `result_hash`
    pub nonce: u64,
    /// Hash of `header ∥ nonce`
    pub result_hash: [u8; HASH_SIZE],
    /// Worker slot that found it
    pub worker_index: usize,
}

/// Throughput report from one worker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashSample {
    /// Worker slot reporting
    pub worker_index: usize,
    /// Hashes computed since the previous sample
    pub hashes: u64,
    /// Time covered by this sample
    pub window: Duration,
}

impl HashSample {
    /// Hashes per second over the sample window
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs > 0.0 {
            self.hashes as f64 / secs
        } else {
            0.0
        }
    }
}

/// The published state every worker reads: which template, split how many ways
#[derive(Debug)]
pub struct Assignment {
    /// Increases on every publication (template change, resize, resume)
    pub version: u64,
    /// Template shared by all workers
    pub template: Arc<WorkTemplate>,
    /// Number of workers the nonce range is divided between
    pub workers: usize,
}

impl Assignment {
    /// Sub-range of the template's nonce space owned by worker `index`
    pub fn range_for(&self, index: usize) -> Range<u64> {
        partition(&self.template.nonce_range, self.workers, index)
    }
}

/// Messages sent from worker threads to the pool supervisor
#[derive(Debug)]
pub enum WorkerEvent {
    /// A solution, stamped with the instant it was found
    Share {
        /// The solution
        share: Share,
        /// Discovery time, used to order concurrent shares
        found_at: Instant,
    },
    /// Periodic throughput report
    Sample(HashSample),
    /// The worker thread ended
    Exited {
        /// Worker slot
        index: usize,
        /// Incarnation of the slot that exited
        generation: u64,
        /// `Err` carries the crash reason
        outcome: Result<(), String>,
    },
    /// Stops the supervisor
    Halt,
}

/// Splits `range` into `parts` contiguous, disjoint slices and returns slice `index`
///
/// Sizes differ by at most one; earlier slices take the remainder. Together the
/// slices cover `range` exactly.
pub fn partition(range: &Range<u64>, parts: usize, index: usize) -> Range<u64> {
    if parts == 0 || index >= parts || range.start >= range.end {
        return range.start..range.start;
    }

    let len = range.end - range.start;
    let parts = parts as u64;
    let index = index as u64;
    let base = len / parts;
    let remainder = len % parts;

    let start = range.start + index * base + index.min(remainder);
    let size = base + u64::from(index < remainder);
    start..start + size
}
