// src/network/pool.rs

//! Mining pool session
//!
//! Owns the connection to one pool server: registration handshake, work
//! notifications, share submission, keepalive and reconnection with backoff.
//! The session runs as a single task; the rest of the miner talks to it
//! through a [`SessionHandle`] and listens to [`SessionEvent`]s.
use crate::miner::template::{Share, WorkTemplate};
use crate::network::backoff::{Backoff, BackoffPolicy};
use crate::network::protocol::{ClientMessage, MinerIdentity, ServerMessage};
use crate::network::state::SessionState;
use crate::network::transport::{Connector, FrameSink, FrameStream, PoolLink};
use crate::utils::error::MinerError;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Known pool servers; the first one is the default
pub const POOL_SERVERS: [&str; 5] = [
    "eu.sushipool.com",
    "us-east.sushipool.com",
    "us-west.sushipool.com",
    "asia.sushipool.com",
    "aus.sushipool.com",
];

/// Default pool port
pub const DEFAULT_POOL_PORT: u16 = 443;

/// Configuration for connecting to a mining pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool server host name (e.g., "eu.sushipool.com")
    #[serde(default = "default_pool_host")]
    pub host: String,
    /// Pool server port
    #[serde(default = "default_pool_port")]
    pub port: u16,
    /// Use TLS (`wss://`)
    #[serde(default = "default_secure")]
    pub secure: bool,
}

fn default_pool_host() -> String {
    POOL_SERVERS[0].to_string()
}

fn default_pool_port() -> u16 {
    DEFAULT_POOL_PORT
}

fn default_secure() -> bool {
    true
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            host: default_pool_host(),
            port: default_pool_port(),
            secure: default_secure(),
        }
    }
}

/// Session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Interval between client pings while active
    pub keepalive_secs: u64,
    /// Silence from the pool after which the connection is considered dead
    pub idle_timeout_secs: u64,
    /// Time allowed for connect plus registration acknowledgment
    pub handshake_timeout_secs: u64,
    /// Consecutive malformed messages tolerated before reconnecting
    pub malformed_threshold: u32,
    /// Number of recent share results considered for the rejection ratio
    pub rejection_window: usize,
    /// Results needed in the window before the ratio is acted on
    pub rejection_min_results: usize,
    /// Rejection ratio above which the session reconnects
    pub rejection_ratio: f64,
    /// Reconnection delays
    pub backoff: BackoffPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            keepalive_secs: 30,
            idle_timeout_secs: 90,
            handshake_timeout_secs: 15,
            malformed_threshold: 5,
            rejection_window: 20,
            rejection_min_results: 10,
            rejection_ratio: 0.5,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Notifications published by a running session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session moved to a new state
    StateChanged(SessionState),
    /// Registration acknowledged; the session is active
    Established,
    /// New work from the pool
    Template(WorkTemplate),
    /// The pool credited a share
    ShareAccepted {
        /// Template of the share, when echoed
        template_id: Option<String>,
    },
    /// The pool refused a share
    ShareRejected {
        /// Pool-supplied reason
        reason: String,
    },
    /// Balance held by the pool for this miner, in atomic units
    PoolBalance {
        /// Total balance
        balance: u64,
        /// Confirmed part
        confirmed: u64,
    },
    /// The previous attempt failed; the next one starts after `delay`
    Reconnecting {
        /// Failed attempts since the last active session
        attempt: u32,
        /// Backoff before the next attempt
        delay: Duration,
    },
}

/// Control side of a [`PoolSession`]
#[derive(Clone)]
pub struct SessionHandle {
    shares: mpsc::UnboundedSender<Share>,
    state: Arc<watch::Sender<SessionState>>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Queues a share for submission
    ///
    /// Shares for a template other than the session's current one are
    /// dropped by the session instead of being sent.
    ///
    /// # Errors
    /// Returns `MinerError::ChannelError` once the session task has ended
    pub fn submit_share(&self, share: Share) -> Result<(), MinerError> {
        self.shares
            .send(share)
            .map_err(|e| MinerError::ChannelError(format!("Pool session is gone: {}", e)))
    }

    /// Terminates the session; idempotent
    pub fn disconnect(&self) {
        self.cancel.cancel();
        // A session that never ran has nobody else to record the shutdown
        self.state.send_if_modified(|state| {
            if *state == SessionState::Disconnected {
                *state = SessionState::Terminated;
                true
            } else {
                false
            }
        });
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}

/// Rolling record of recent share results
#[derive(Debug, Clone)]
pub struct RejectionWindow {
    results: VecDeque<bool>,
    capacity: usize,
    min_results: usize,
    max_ratio: f64,
}

impl RejectionWindow {
    /// Empty window with the limits from `settings`
    pub fn new(settings: &SessionSettings) -> Self {
        RejectionWindow {
            results: VecDeque::with_capacity(settings.rejection_window),
            capacity: settings.rejection_window.max(1),
            min_results: settings.rejection_min_results,
            max_ratio: settings.rejection_ratio,
        }
    }

    /// Records one result; true when the rejection ratio is over the limit
    pub fn record(&mut self, accepted: bool) -> bool {
        if self.results.len() == self.capacity {
            self.results.pop_front();
        }
        self.results.push_back(accepted);
        self.results.len() >= self.min_results && self.ratio() > self.max_ratio
    }

    /// Fraction of rejected results in the window
    pub fn ratio(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        let rejected = self.results.iter().filter(|accepted| !**accepted).count();
        rejected as f64 / self.results.len() as f64
    }

    /// Forgets all results
    pub fn clear(&mut self) {
        self.results.clear();
    }
}

/// Connection to a mining pool
///
/// Handles:
/// - Registration with the miner identity
/// - Forwarding work notifications
/// - Share submission and result tracking
/// - Keepalive and idle detection
/// - Reconnection with exponential backoff
pub struct PoolSession {
    identity: MinerIdentity,
    settings: SessionSettings,
    connector: Arc<dyn Connector>,
    state: Arc<watch::Sender<SessionState>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shares: mpsc::UnboundedReceiver<Share>,
    shares_closed: bool,
    cancel: CancellationToken,
    backoff: Backoff,
    current_template: Option<String>,
    malformed: u32,
    results: RejectionWindow,
    stale_shares: u64,
}

impl PoolSession {
    /// Creates a session in the `Disconnected` state
    ///
    /// # Arguments
    /// * `identity` - Registration identity
    /// * `settings` - Timers and thresholds
    /// * `connector` - Transport used for every connection attempt
    ///
    /// # Returns
    /// The session (to be driven by [`PoolSession::run`]), its control handle
    /// and the receiver of its events
    pub fn new(
        identity: MinerIdentity,
        settings: SessionSettings,
        connector: Arc<dyn Connector>,
    ) -> (PoolSession, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (shares_tx, shares_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Disconnected);
        let state = Arc::new(state);
        let cancel = CancellationToken::new();

        let handle = SessionHandle {
            shares: shares_tx,
            state: state.clone(),
            cancel: cancel.clone(),
        };
        let session = PoolSession {
            identity,
            backoff: Backoff::new(settings.backoff),
            results: RejectionWindow::new(&settings),
            settings,
            connector,
            state,
            events: events_tx,
            shares: shares_rx,
            shares_closed: false,
            cancel,
            current_template: None,
            malformed: 0,
            stale_shares: 0,
        };

        (session, handle, events_rx)
    }

    /// Connects to `host:port` and keeps the session alive until disconnected
    ///
    /// Transport and protocol failures never end this future; they lead to
    /// `Reconnecting` and another attempt after the backoff delay.
    ///
    /// # Errors
    /// Returns `MinerError::InvalidTransition` if the state machine is driven
    /// outside its transition table
    pub async fn run(mut self, host: String, port: u16) -> Result<(), MinerError> {
        let result = self.drive(&host, port).await;
        self.terminate();
        log::info!(
            "Pool session with {}:{} terminated ({} stale shares dropped)",
            host,
            port,
            self.stale_shares
        );

        if self.cancel.is_cancelled() {
            Ok(())
        } else {
            result
        }
    }

    async fn drive(&mut self, host: &str, port: u16) -> Result<(), MinerError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.enter(SessionState::Connecting)?;

            let error = match self.attempt(host, port).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            log::warn!("Pool session with {}:{} failed: {}", host, port, error);
            self.enter(SessionState::Reconnecting)?;
            let delay = self.backoff.next_delay();
            let attempt = self.backoff.attempt();
            log::info!(
                "Reconnecting to {}:{} in {:.1}s (attempt {})",
                host,
                port,
                delay.as_secs_f64(),
                attempt
            );
            self.emit(SessionEvent::Reconnecting { attempt, delay });

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = time::sleep(delay) => {}
            }
        }
    }

    /// One connection: connect, register, serve. `Ok` means cancelled.
    async fn attempt(&mut self, host: &str, port: u16) -> Result<(), MinerError> {
        let cancel = self.cancel.clone();
        let connector = self.connector.clone();
        let handshake = Duration::from_secs(self.settings.handshake_timeout_secs);

        let link = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            link = time::timeout(handshake, connector.connect(host, port)) => link.map_err(|_| {
                MinerError::ConnectionError(format!("Timed out connecting to {}:{}", host, port))
            })??,
        };
        let PoolLink {
            mut sink,
            mut stream,
        } = link;

        self.enter(SessionState::Subscribing)?;
        self.malformed = 0;
        let register = ClientMessage::register(&self.identity).to_frame()?;
        time::timeout(handshake, sink.send(register))
            .await
            .map_err(|_| {
                MinerError::ConnectionError(format!("Timed out registering with {}:{}", host, port))
            })??;
        log::debug!(
            "Registering device {} ({}) with {}:{}",
            self.identity.device_id,
            self.identity.device_name,
            host,
            port
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                self.close(&mut sink).await;
                return Ok(());
            }
            registered = time::timeout(handshake, self.await_registration(&mut sink, &mut stream)) => {
                registered.map_err(|_| {
                    MinerError::ConnectionError(format!(
                        "No registration acknowledgment from {}:{} within {:?}",
                        host, port, handshake
                    ))
                })??;
            }
        }

        self.enter(SessionState::Active)?;
        self.backoff.reset();
        self.results.clear();
        self.current_template = None;
        log::info!("Connected to pool {}:{}", host, port);
        self.emit(SessionEvent::Established);

        let served = self.serve(&cancel, &mut sink, &mut stream).await;
        self.close(&mut sink).await;
        served
    }

    /// Closes the link; a peer that stops reading cannot hold it open past
    /// the handshake timeout
    async fn close(&self, sink: &mut FrameSink) {
        let limit = Duration::from_secs(self.settings.handshake_timeout_secs);
        match time::timeout(limit, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("Closing pool link: {}", e),
            Err(_) => log::warn!("Pool link did not close within {:?}, dropping it", limit),
        }
    }

    async fn await_registration(
        &mut self,
        sink: &mut FrameSink,
        stream: &mut FrameStream,
    ) -> Result<(), MinerError> {
        while let Some(frame) = stream.next().await {
            match self.parse_frame(&frame?)? {
                Some(ServerMessage::Registered) => return Ok(()),
                Some(ServerMessage::Ping) => sink.send(ClientMessage::Pong.to_frame()?).await?,
                Some(ServerMessage::Error { reason }) => {
                    return Err(MinerError::ProtocolError(format!(
                        "Pool refused registration: {}",
                        reason
                    )));
                }
                Some(other) => log::debug!("Ignoring {:?} before registration", other),
                None => {}
            }
        }
        Err(MinerError::ConnectionError(
            "Pool closed the connection during registration".into(),
        ))
    }

    async fn serve(
        &mut self,
        cancel: &CancellationToken,
        sink: &mut FrameSink,
        stream: &mut FrameStream,
    ) -> Result<(), MinerError> {
        let period = Duration::from_secs(self.settings.keepalive_secs.max(1));
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let idle_timeout = Duration::from_secs(self.settings.idle_timeout_secs.max(1));
        let idle = time::sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = stream.next() => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    match frame {
                        Some(Ok(text)) => self.handle_frame(&text, sink).await?,
                        Some(Err(e)) => return Err(e),
                        None => {
                            return Err(MinerError::ConnectionError(
                                "Pool closed the connection".into(),
                            ));
                        }
                    }
                }
                share = self.shares.recv(), if !self.shares_closed => match share {
                    Some(share) => self.submit(share, sink).await?,
                    None => self.shares_closed = true,
                },
                _ = keepalive.tick() => {
                    sink.send(ClientMessage::Ping.to_frame()?).await?;
                }
                _ = &mut idle => {
                    return Err(MinerError::ConnectionError(format!(
                        "No traffic from pool for {:?}",
                        idle_timeout
                    )));
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: &str, sink: &mut FrameSink) -> Result<(), MinerError> {
        let Some(message) = self.parse_frame(frame)? else {
            return Ok(());
        };

        match message {
            ServerMessage::NewBlock(template) => {
                log::debug!(
                    "Work notification: template {} at height {}",
                    template.template_id,
                    template.height
                );
                self.current_template = Some(template.template_id.clone());
                self.emit(SessionEvent::Template(template));
            }
            ServerMessage::ShareAccepted { template_id, nonce } => {
                log::info!(
                    "Share accepted (template {}, nonce {})",
                    template_id.as_deref().unwrap_or("?"),
                    nonce.map_or_else(|| "?".to_string(), |n| n.to_string())
                );
                self.emit(SessionEvent::ShareAccepted { template_id });
                self.record_result(true)?;
            }
            ServerMessage::ShareRejected {
                template_id,
                nonce,
                reason,
            } => {
                log::warn!(
                    "Share rejected (template {}, nonce {}): {}",
                    template_id.as_deref().unwrap_or("?"),
                    nonce.map_or_else(|| "?".to_string(), |n| n.to_string()),
                    reason
                );
                self.emit(SessionEvent::ShareRejected { reason });
                self.record_result(false)?;
            }
            ServerMessage::Balance {
                balance,
                confirmed_balance,
            } => self.emit(SessionEvent::PoolBalance {
                balance,
                confirmed: confirmed_balance,
            }),
            ServerMessage::Ping => sink.send(ClientMessage::Pong.to_frame()?).await?,
            ServerMessage::Pong => {}
            ServerMessage::Registered => log::debug!("Duplicate registration acknowledgment"),
            ServerMessage::Error { reason } => log::error!("Pool error: {}", reason),
        }
        Ok(())
    }

    /// `Ok(None)` for a tolerated malformed frame
    fn parse_frame(&mut self, frame: &str) -> Result<Option<ServerMessage>, MinerError> {
        match ServerMessage::parse(frame) {
            Ok(message) => {
                self.malformed = 0;
                Ok(Some(message))
            }
            Err(e) => {
                self.malformed += 1;
                log::warn!(
                    "Ignoring malformed pool message ({} in a row): {}",
                    self.malformed,
                    e
                );
                if self.malformed > self.settings.malformed_threshold {
                    return Err(MinerError::ProtocolError(format!(
                        "{} consecutive malformed messages",
                        self.malformed
                    )));
                }
                Ok(None)
            }
        }
    }

    fn record_result(&mut self, accepted: bool) -> Result<(), MinerError> {
        if self.results.record(accepted) {
            return Err(MinerError::ProtocolError(format!(
                "Share rejection ratio {:.0}% over the last results",
                self.results.ratio() * 100.0
            )));
        }
        Ok(())
    }

    async fn submit(&mut self, share: Share, sink: &mut FrameSink) -> Result<(), MinerError> {
        if self.current_template.as_deref() != Some(share.template_id.as_str()) {
            self.stale_shares += 1;
            log::debug!(
                "Dropping stale share for template {} from worker {}",
                share.template_id,
                share.worker_index
            );
            return Ok(());
        }

        sink.send(ClientMessage::share(&share).to_frame()?).await?;
        log::info!(
            "Submitted share for template {} (nonce {}, worker {})",
            share.template_id,
            share.nonce,
            share.worker_index
        );
        Ok(())
    }

    fn enter(&self, next: SessionState) -> Result<(), MinerError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|current| match current.transition(next) {
            Ok(next) => {
                *current = next;
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        if outcome.is_ok() {
            log::debug!("Pool session {}", next);
            self.emit(SessionEvent::StateChanged(next));
        }
        outcome
    }

    fn terminate(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Terminated {
                false
            } else {
                *state = SessionState::Terminated;
                true
            }
        });
        if changed {
            self.emit(SessionEvent::StateChanged(SessionState::Terminated));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is not an error for the session
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct Unreachable;

    impl Connector for Unreachable {
        fn connect<'a>(&'a self, host: &'a str, _port: u16) -> BoxFuture<'a, Result<PoolLink, MinerError>> {
            Box::pin(async move {
                Err::<PoolLink, _>(MinerError::ConnectionError(format!("{} unreachable", host)))
            })
        }
    }

    /// Sink that takes frames but never finishes closing
    struct Unclosable;

    impl futures::Sink<String> for Unclosable {
        type Error = MinerError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), MinerError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, _frame: String) -> Result<(), MinerError> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), MinerError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), MinerError>> {
            Poll::Pending
        }
    }

    /// Registers, then goes quiet and never lets go of the link
    struct Stalled;

    impl Connector for Stalled {
        fn connect<'a>(&'a self, _host: &'a str, _port: u16) -> BoxFuture<'a, Result<PoolLink, MinerError>> {
            Box::pin(async move {
                let registered = r#"{"message":"registered"}"#.to_string();
                let stream = futures::stream::iter([Ok::<_, MinerError>(registered)])
                    .chain(futures::stream::pending());
                Ok::<_, MinerError>(PoolLink {
                    sink: Box::pin(Unclosable),
                    stream: Box::pin(stream),
                })
            })
        }
    }

    fn identity() -> MinerIdentity {
        MinerIdentity {
            wallet_address: "NQ07 0000 0000 0000 0000 0000 0000 0000 0000".into(),
            device_id: 7,
            device_name: "test".into(),
        }
    }

    #[test]
    fn rejection_window_needs_minimum_results() {
        let mut window = RejectionWindow::new(&SessionSettings::default());
        for _ in 0..9 {
            assert!(!window.record(false));
        }
        assert!(window.record(false));
    }

    #[test]
    fn rejection_window_rolls_over_old_results() {
        let mut window = RejectionWindow::new(&SessionSettings::default());
        for _ in 0..20 {
            assert!(!window.record(true));
        }
        // 10 rejected out of the last 20 is exactly the limit, not above it
        for _ in 0..10 {
            assert!(!window.record(false));
        }
        assert!(window.record(false));
        assert!((window.ratio() - 11.0 / 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn disconnect_before_run_terminates() {
        let (_session, handle, _events) =
            PoolSession::new(identity(), SessionSettings::default(), Arc::new(Unreachable));
        assert_eq!(handle.state(), SessionState::Disconnected);

        handle.disconnect();
        handle.disconnect();
        assert_eq!(handle.state(), SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_does_not_wait_on_a_stuck_link() {
        let settings = SessionSettings::default();
        let (session, handle, mut events) =
            PoolSession::new(identity(), settings.clone(), Arc::new(Stalled));
        let task = tokio::spawn(session.run("pool.test".into(), 443));

        while events.recv().await != Some(SessionEvent::Established) {}
        let disconnected_at = Instant::now();
        handle.disconnect();

        time::timeout(Duration::from_secs(60), task)
            .await
            .expect("session hung on close")
            .unwrap()
            .unwrap();
        assert!(disconnected_at.elapsed() <= Duration::from_secs(settings.handshake_timeout_secs));
        assert_eq!(handle.state(), SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_backoff_ends_run() {
        let (session, handle, mut events) =
            PoolSession::new(identity(), SessionSettings::default(), Arc::new(Unreachable));
        let task = tokio::spawn(session.run("pool.invalid".into(), 443));

        loop {
            match events.recv().await {
                Some(SessionEvent::Reconnecting { attempt, .. }) => {
                    assert_eq!(attempt, 1);
                    break;
                }
                Some(_) => continue,
                None => panic!("session ended early"),
            }
        }
        assert_eq!(handle.state(), SessionState::Reconnecting);

        handle.disconnect();
        task.await.unwrap().unwrap();
        assert_eq!(handle.state(), SessionState::Terminated);
        assert!(handle.submit_share(Share {
            template_id: "t".into(),
            nonce: 0,
            result_hash: [0; 32],
            worker_index: 0,
        })
        .is_err());
    }
}
