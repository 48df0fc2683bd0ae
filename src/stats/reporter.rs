// src/stats/reporter.rs
use crate::network::node::Ledger;
use crate::utils::error::MinerError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hashrate samples averaged into one summary line
pub const DEFAULT_SAMPLE_WINDOW: usize = 5;

/// Atomic units per coin
pub const UNITS_PER_COIN: u64 = 100_000;

const HASHRATE_UNITS: [&str; 9] = [
    "H/s", "kH/s", "MH/s", "GH/s", "TH/s", "PH/s", "EH/s", "ZH/s", "YH/s",
];

/// Formats a hashrate with one decimal in the largest fitting unit
///
/// The unit is picked on the rounded value, so 999 999 999 H/s prints as
/// `1.0 GH/s` rather than `1000.0 MH/s`.
pub fn humanize_hashrate(rate: f64) -> String {
    let mut value = if rate.is_finite() { rate.max(0.0) } else { 0.0 };
    let mut unit = 0;
    while unit < HASHRATE_UNITS.len() - 1 && (value * 10.0).round() / 10.0 >= 1000.0 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.1} {}", value, HASHRATE_UNITS[unit])
}

/// Formats atomic units as coins with full precision
pub fn format_coins(units: u64) -> String {
    format!("{}.{:05}", units / UNITS_PER_COIN, units % UNITS_PER_COIN)
}

/// Share results reported by the pool
#[derive(Debug, Default)]
pub struct ShareTally {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl ShareTally {
    /// Counts an accepted share
    pub fn accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a rejected share
    pub fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// (accepted, rejected)
    pub fn totals(&self) -> (u64, u64) {
        (
            self.accepted.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }
}

/// Turns pool hashrate samples into periodic summary lines
pub struct StatsReporter {
    /// Samples per summary
    window: usize,
    /// Samples of the current window
    samples: Vec<f64>,
    /// Address whose balance is shown
    wallet_address: String,
    /// Source of balance and mempool size
    ledger: Arc<dyn Ledger>,
    shares: Arc<ShareTally>,
}

impl StatsReporter {
    /// Creates a reporter
    ///
    /// # Arguments
    /// * `wallet_address` - Address whose balance is reported
    /// * `ledger` - Balance and mempool source
    /// * `window` - Number of samples averaged per line (at least 1)
    pub fn new(wallet_address: String, ledger: Arc<dyn Ledger>, window: usize) -> Self {
        let window = window.max(1);
        StatsReporter {
            window,
            samples: Vec::with_capacity(window),
            wallet_address,
            ledger,
            shares: Arc::new(ShareTally::default()),
        }
    }

    /// Counter shared with whoever sees pool share results
    pub fn share_tally(&self) -> Arc<ShareTally> {
        self.shares.clone()
    }

    /// Adds a sample; returns the window average once the window is full
    pub fn record(&mut self, rate: f64) -> Option<f64> {
        self.samples.push(rate);
        if self.samples.len() < self.window {
            return None;
        }
        let average = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        self.samples.clear();
        Some(average)
    }

    /// Builds the summary line for `average`
    ///
    /// # Errors
    /// Returns the ledger error if balance or mempool could not be read
    pub async fn summary(&self, average: f64) -> Result<String, MinerError> {
        summarize(
            self.ledger.as_ref(),
            &self.wallet_address,
            &self.shares,
            average,
        )
        .await
    }

    /// Records a sample and publishes a summary line when a window closes
    ///
    /// The ledger is queried on a separate task so the caller never waits
    /// on it. A failing ledger skips the line.
    pub fn observe(&mut self, rate: f64) {
        let Some(average) = self.record(rate) else {
            return;
        };

        let ledger = self.ledger.clone();
        let address = self.wallet_address.clone();
        let shares = self.shares.clone();
        tokio::spawn(async move {
            match summarize(ledger.as_ref(), &address, &shares, average).await {
                Ok(line) => log::info!("{}", line),
                Err(e) => log::warn!("Skipping stats report: {}", e),
            }
        });
    }
}

async fn summarize(
    ledger: &dyn Ledger,
    address: &str,
    shares: &ShareTally,
    average: f64,
) -> Result<String, MinerError> {
    let balance = ledger.balance(address).await?;
    let pending = ledger.pending_transactions().await?;
    let (accepted, rejected) = shares.totals();

    Ok(format!(
        "Hashrate: {} - Balance: {} NIM - Mempool: {} tx - Shares: {} accepted / {} rejected",
        humanize_hashrate(average),
        format_coins(balance),
        pending,
        accepted,
        rejected
    ))
}
