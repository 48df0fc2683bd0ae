// src/controller.rs
//! Miner orchestration
//!
//! Connects the consensus layer, the pool session and the worker pool:
//! consensus decides whether work runs, the session supplies templates and
//! takes shares, the pool turns templates into shares and hashrate.

use crate::config::Config;
use crate::miner::scheduler::WorkerPool;
use crate::miner::template::Share;
use crate::network::node::{ConsensusEvent, Ledger};
use crate::network::pool::{PoolConfig, PoolSession, SessionEvent, SessionHandle, SessionSettings};
use crate::network::protocol::MinerIdentity;
use crate::network::state::SessionState;
use crate::network::transport::Connector;
use crate::stats::reporter::{ShareTally, StatsReporter, format_coins};
use crate::utils::error::MinerError;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What the controller needs from the configuration
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Resolved worker thread count
    pub threads: usize,
    /// Pool server
    pub pool: PoolConfig,
    /// Session timers and thresholds
    pub session: SessionSettings,
    /// Samples averaged per statistics line
    pub stats_samples: usize,
}

impl ControllerSettings {
    /// Settings taken from a validated configuration
    pub fn from_config(config: &Config) -> Self {
        ControllerSettings {
            threads: config.threads.resolve(),
            pool: config.pool.clone(),
            session: config.session.clone(),
            stats_samples: config.stats_samples,
        }
    }
}

/// Drives the miner from consensus and pool events
pub struct MinerController {
    identity: MinerIdentity,
    settings: ControllerSettings,
    pool: Arc<WorkerPool>,
    connector: Arc<dyn Connector>,
    ledger: Arc<dyn Ledger>,
}

/// Mutable state of one controller run
struct Wiring {
    settings: ControllerSettings,
    identity: MinerIdentity,
    pool: Arc<WorkerPool>,
    handle: SessionHandle,
    /// Waiting for the first consensus
    session: Option<PoolSession>,
    session_task: Option<JoinHandle<Result<(), MinerError>>>,
    consensus: bool,
    session_active: bool,
    tally: Arc<ShareTally>,
    started: Instant,
}

impl MinerController {
    /// Creates a controller
    ///
    /// # Arguments
    /// * `identity` - Identity registered with the pool
    /// * `settings` - Threads, pool endpoint and tuning
    /// * `pool` - Idle worker pool
    /// * `connector` - Transport for the pool session
    /// * `ledger` - Balance and mempool source for the statistics line
    pub fn new(
        identity: MinerIdentity,
        settings: ControllerSettings,
        pool: WorkerPool,
        connector: Arc<dyn Connector>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        MinerController {
            identity,
            settings,
            pool: Arc::new(pool),
            connector,
            ledger,
        }
    }

    /// The worker pool driven by this controller
    pub fn worker_pool(&self) -> Arc<WorkerPool> {
        self.pool.clone()
    }

    /// Runs until `shutdown` completes or the worker pool fails
    ///
    /// The pool session starts on the first established consensus. Workers
    /// run while consensus holds and the session has been active; losing
    /// consensus pauses them.
    ///
    /// # Errors
    /// Returns the escalated worker failure, or `MinerError::TaskError` if
    /// the pool session ends on its own
    pub async fn run<F>(
        self,
        mut consensus: mpsc::UnboundedReceiver<ConsensusEvent>,
        shutdown: F,
    ) -> Result<(), MinerError>
    where
        F: Future<Output = ()>,
    {
        let (session, handle, mut session_events) = PoolSession::new(
            self.identity.clone(),
            self.settings.session.clone(),
            self.connector.clone(),
        );

        let (share_tx, mut shares) = mpsc::unbounded_channel();
        self.pool.on_share(move |share| {
            let _ = share_tx.send(share);
        });
        let (rate_tx, mut rates) = mpsc::unbounded_channel();
        self.pool.on_hashrate_sample(move |rate| {
            let _ = rate_tx.send(rate);
        });
        let (fatal_tx, mut fatal) = mpsc::unbounded_channel();
        self.pool.on_fatal(move |error| {
            let _ = fatal_tx.send(error);
        });

        let mut reporter = StatsReporter::new(
            self.identity.wallet_address.clone(),
            self.ledger.clone(),
            self.settings.stats_samples,
        );
        log_wallet(self.ledger.clone(), self.identity.wallet_address.clone());

        let mut wiring = Wiring {
            settings: self.settings.clone(),
            identity: self.identity.clone(),
            pool: self.pool.clone(),
            handle,
            session: Some(session),
            session_task: None,
            consensus: false,
            session_active: false,
            tally: reporter.share_tally(),
            started: Instant::now(),
        };
        let mut consensus_open = true;
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutting down");
                    break Ok(());
                }
                error = fatal.recv() => {
                    if let Some(error) = error {
                        log::error!("Worker pool failed: {}", error);
                        break Err(error);
                    }
                }
                event = consensus.recv(), if consensus_open => match event {
                    Some(event) => {
                        if let Err(e) = wiring.on_consensus(event) {
                            break Err(e);
                        }
                    }
                    None => {
                        log::warn!("Consensus source closed");
                        consensus_open = false;
                    }
                },
                event = session_events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = wiring.on_session(event) {
                            break Err(e);
                        }
                    }
                    None => break Err(MinerError::TaskError("Pool session ended".into())),
                },
                share = shares.recv() => {
                    if let Some(share) = share {
                        wiring.on_share(share);
                    }
                }
                rate = rates.recv() => {
                    if let Some(rate) = rate {
                        reporter.observe(rate);
                    }
                }
            }
        };

        wiring.handle.disconnect();
        if let Some(task) = wiring.session_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Pool session ended with error: {}", e),
                Err(e) => log::warn!("Pool session task failed: {}", e),
            }
        }
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || pool.shutdown()).await?;

        outcome
    }
}

impl Wiring {
    fn on_consensus(&mut self, event: ConsensusEvent) -> Result<(), MinerError> {
        match event {
            ConsensusEvent::Established => {
                self.consensus = true;
                log::info!(
                    "Blockchain consensus established in {:.1}s.",
                    self.started.elapsed().as_secs_f64()
                );
                if let Some(session) = self.session.take() {
                    log::info!(
                        "Connecting to pool {} using device id {} as a smart client.",
                        self.settings.pool.host,
                        self.identity.device_id
                    );
                    let host = self.settings.pool.host.clone();
                    let port = self.settings.pool.port;
                    self.session_task = Some(tokio::spawn(session.run(host, port)));
                }
                self.resume()?;
            }
            ConsensusEvent::Lost => {
                self.consensus = false;
                log::warn!("Consensus lost, pausing workers");
                self.pool.pause();
            }
            ConsensusEvent::HeadChanged { height } => {
                if self.consensus || height % 100 == 0 {
                    log::info!("Now at block: {}", height);
                }
            }
            ConsensusEvent::PeerJoined(peer) => log::info!("Connected to {}", peer),
            ConsensusEvent::PeerLeft(peer) => log::info!("Disconnected from {}", peer),
        }
        Ok(())
    }

    fn on_session(&mut self, event: SessionEvent) -> Result<(), MinerError> {
        match event {
            SessionEvent::Established => {
                self.session_active = true;
                self.resume()?;
            }
            SessionEvent::StateChanged(SessionState::Reconnecting) => {
                self.session_active = false;
            }
            SessionEvent::StateChanged(_) => {}
            SessionEvent::Template(template) => self.pool.set_template(template),
            SessionEvent::ShareAccepted { .. } => self.tally.accepted(),
            SessionEvent::ShareRejected { .. } => self.tally.rejected(),
            SessionEvent::PoolBalance { balance, confirmed } => log::info!(
                "Pool balance: {} NIM ({} NIM confirmed)",
                format_coins(balance),
                format_coins(confirmed)
            ),
            SessionEvent::Reconnecting { attempt, delay } => {
                log::debug!("Pool reconnect #{} in {:?}", attempt, delay)
            }
        }
        Ok(())
    }

    fn on_share(&self, share: Share) {
        if let Some(template) = self.pool.current_template() {
            if template.template_id == share.template_id
                && template.meets_block_target(&share.result_hash)
            {
                log::info!(
                    "Block mined: #{}, hash={}",
                    template.height,
                    hex::encode(share.result_hash)
                );
            }
        }

        if let Err(e) = self.handle.submit_share(share) {
            log::warn!("Share not submitted: {}", e);
        }
    }

    /// Starts the workers once both consensus and the session are up
    fn resume(&self) -> Result<(), MinerError> {
        if self.consensus && self.session_active && !self.pool.is_running() {
            self.pool.start(self.settings.threads)?;
        }
        Ok(())
    }
}

/// Logs the wallet balance once, off the control loop
fn log_wallet(ledger: Arc<dyn Ledger>, address: String) {
    tokio::spawn(async move {
        match ledger.balance(&address).await {
            Ok(balance) => log::info!(
                "Wallet initialized for address {}. Balance: {} NIM",
                address,
                format_coins(balance)
            ),
            Err(e) => log::warn!("Could not read balance of {}: {}", address, e),
        }
    });
}
