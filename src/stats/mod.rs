//! Statistics collection and reporting module
//!
//! Averages pool-wide hashrate samples over a fixed number of reports and
//! pairs the result with the wallet balance, the mempool size and the share
//! results seen from the pool.
//!

/// Submodule containing the statistics reporter implementation
pub mod reporter;

// Re-export main components
pub use reporter::{ShareTally, StatsReporter, format_coins, humanize_hashrate};
