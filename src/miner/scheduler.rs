// src/miner/scheduler.rs
//! Worker pool: job distribution, supervision and aggregation
//!
//! The pool publishes one immutable [`Assignment`] through an `ArcSwapOption`;
//! workers pick it up on their own schedule, so replacing the template never
//! blocks a hashing thread. A supervisor thread drains the worker event channel,
//! restarts crashed workers, orders shares and turns samples into a pool-wide
//! hashrate.

use crate::miner::algorithm::Algorithm;
use crate::miner::template::{Assignment, Share, WorkTemplate, WorkerEvent};
use crate::miner::worker::HashWorker;
use crate::utils::error::MinerError;
use arc_swap::ArcSwapOption;
use crossbeam_channel::{Receiver, Sender, select, tick, unbounded};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Consecutive immediate crashes of one slot before the pool gives up
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

type ShareCallback = Box<dyn Fn(Share) + Send + Sync>;
type RateCallback = Box<dyn Fn(f64) + Send + Sync>;
type FatalCallback = Box<dyn Fn(MinerError) + Send + Sync>;

/// Timing knobs for the pool
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// How often each worker reports its hash count
    pub sample_interval: Duration,
    /// Length of the pool-wide hashrate window
    pub report_window: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            sample_interval: Duration::from_millis(500),
            report_window: Duration::from_secs(1),
        }
    }
}

/// Bookkeeping for one worker position
struct Slot {
    generation: u64,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    failures: u32,
    progressed: bool,
}

/// State shared between the pool handle and its supervisor thread
struct Shared {
    algorithm: Arc<dyn Algorithm>,
    settings: PoolSettings,
    /// What the workers read
    published: Arc<ArcSwapOption<Assignment>>,
    /// Latest template, kept while paused
    template: ArcSwapOption<WorkTemplate>,
    running: AtomicBool,
    failed: AtomicBool,
    halted: AtomicBool,
    version: AtomicU64,
    /// Source of unique worker incarnation numbers
    generations: AtomicU64,
    slots: Mutex<Vec<Slot>>,
    /// Nonces already delivered for the current template; the lock also
    /// serializes template swaps against share delivery
    delivered: Mutex<HashSet<u64>>,
    events_tx: Sender<WorkerEvent>,
    share_callbacks: Mutex<Vec<ShareCallback>>,
    rate_callbacks: Mutex<Vec<RateCallback>>,
    fatal_callbacks: Mutex<Vec<FatalCallback>>,
}

/// Coordinates mining work across worker threads
pub struct WorkerPool {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates an idle pool with no workers
    ///
    /// # Arguments
    /// * `algorithm` - Hash implementation shared by all workers
    /// * `settings` - Sampling and reporting intervals
    pub fn new(algorithm: Arc<dyn Algorithm>, settings: PoolSettings) -> Result<Self, MinerError> {
        let (events_tx, events_rx) = unbounded();
        let shared = Arc::new(Shared {
            algorithm,
            settings,
            published: Arc::new(ArcSwapOption::empty()),
            template: ArcSwapOption::empty(),
            running: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            version: AtomicU64::new(0),
            generations: AtomicU64::new(0),
            slots: Mutex::new(Vec::new()),
            delivered: Mutex::new(HashSet::new()),
            events_tx,
            share_callbacks: Mutex::new(Vec::new()),
            rate_callbacks: Mutex::new(Vec::new()),
            fatal_callbacks: Mutex::new(Vec::new()),
        });

        let supervisor_shared = shared.clone();
        let supervisor = std::thread::Builder::new()
            .name("pool-supervisor".into())
            .spawn(move || supervise(supervisor_shared, events_rx))?;

        Ok(WorkerPool {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Sets the number of running workers
    ///
    /// Extra workers are stopped, missing ones spawned, and the assignment is
    /// republished so every worker recomputes its share of the nonce space.
    pub fn resize(&self, threads: usize) -> Result<(), MinerError> {
        if threads == 0 {
            return Err(MinerError::InputError(
                "Thread count must be at least 1".into(),
            ));
        }
        self.ensure_usable()?;

        let mut slots = self.shared.slots.lock();
        while slots.len() > threads {
            if let Some(slot) = slots.pop() {
                slot.stop.store(true, Ordering::SeqCst);
            }
        }
        while slots.len() < threads {
            let index = slots.len();
            slots.push(self.shared.spawn_slot(index)?);
        }
        self.shared.publish(slots.len());

        log::info!("Worker pool running {} threads", threads);
        Ok(())
    }

    /// Replaces the current template for all workers
    ///
    /// Once this returns no share for an earlier template is delivered to
    /// the share callbacks.
    pub fn set_template(&self, template: WorkTemplate) {
        log::info!(
            "New template {} at height {} ({} nonces)",
            template.template_id,
            template.height,
            template.nonce_range.end.saturating_sub(template.nonce_range.start)
        );

        let slots = self.shared.slots.lock();
        let mut delivered = self.shared.delivered.lock();
        let same_work = matches!(
            &*self.shared.template.load(),
            Some(current) if current.template_id == template.template_id
        );
        if !same_work {
            delivered.clear();
        }
        self.shared.template.store(Some(Arc::new(template)));
        self.shared.publish(slots.len());
    }

    /// Starts (or resumes) hashing with `threads` workers
    pub fn start(&self, threads: usize) -> Result<(), MinerError> {
        self.ensure_usable()?;
        self.shared.running.store(true, Ordering::SeqCst);
        self.resize(threads)
    }

    /// Parks all workers without stopping their threads
    pub fn pause(&self) {
        let slots = self.shared.slots.lock();
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.publish(slots.len());
        log::info!("Mining paused");
    }

    /// Whether workers are currently given work
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Number of worker slots
    pub fn active_workers(&self) -> usize {
        self.shared.slots.lock().len()
    }

    /// Latest template, whether running or paused
    pub fn current_template(&self) -> Option<Arc<WorkTemplate>> {
        self.shared.template.load_full()
    }

    /// Nonce sub-ranges of the published assignment, by worker index
    pub fn assignments(&self) -> Vec<Range<u64>> {
        match self.shared.published.load_full() {
            Some(assignment) => (0..assignment.workers)
                .map(|index| assignment.range_for(index))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Registers a consumer for found shares
    pub fn on_share<F>(&self, callback: F)
    where
        F: Fn(Share) + Send + Sync + 'static,
    {
        self.shared.share_callbacks.lock().push(Box::new(callback));
    }

    /// Registers a consumer for the pool-wide hashrate (H/s), once per window
    pub fn on_hashrate_sample<F>(&self, callback: F)
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.shared.rate_callbacks.lock().push(Box::new(callback));
    }

    /// Registers a consumer for the escalated worker failure
    pub fn on_fatal<F>(&self, callback: F)
    where
        F: Fn(MinerError) + Send + Sync + 'static,
    {
        self.shared.fatal_callbacks.lock().push(Box::new(callback));
    }

    /// Stops all workers and the supervisor; idempotent
    pub fn shutdown(&self) {
        if self.shared.halted.swap(true, Ordering::SeqCst) {
            return;
        }

        let slots: Vec<Slot> = {
            let mut slots = self.shared.slots.lock();
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.publish(0);
            slots.drain(..).collect()
        };
        for slot in &slots {
            slot.stop.store(true, Ordering::SeqCst);
        }
        for mut slot in slots {
            if let Some(handle) = slot.handle.take() {
                let _ = handle.join();
            }
        }

        let _ = self.shared.events_tx.send(WorkerEvent::Halt);
        if let Some(supervisor) = self.supervisor.lock().take() {
            let _ = supervisor.join();
        }
        log::debug!("Worker pool shut down");
    }

    fn ensure_usable(&self) -> Result<(), MinerError> {
        if self.shared.failed.load(Ordering::SeqCst) {
            return Err(MinerError::TaskError("Worker pool has failed".into()));
        }
        if self.shared.halted.load(Ordering::SeqCst) {
            return Err(MinerError::TaskError("Worker pool is shut down".into()));
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Publishes a fresh assignment, or clears it when there is nothing to run
    ///
    /// Callers hold the slots lock so versions are published in order.
    fn publish(&self, workers: usize) {
        let running = self.running.load(Ordering::SeqCst) && !self.failed.load(Ordering::SeqCst);
        let next = match self.template.load_full() {
            Some(template) if running && workers > 0 => Some(Arc::new(Assignment {
                version: self.version.fetch_add(1, Ordering::SeqCst) + 1,
                template,
                workers,
            })),
            _ => None,
        };
        self.published.store(next);
    }

    fn spawn_slot(self: &Arc<Self>, index: usize) -> Result<Slot, MinerError> {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = HashWorker::new(
            index,
            generation,
            self.algorithm.clone(),
            self.published.clone(),
            stop.clone(),
            self.events_tx.clone(),
            self.settings.sample_interval,
        )
        .spawn()?;

        Ok(Slot {
            generation,
            stop,
            handle: Some(handle),
            failures: 0,
            progressed: false,
        })
    }

    fn mark_progress(&self, index: usize) {
        if let Some(slot) = self.slots.lock().get_mut(index) {
            slot.progressed = true;
        }
    }

    /// Restarts a crashed worker in place, or escalates a failing slot
    fn handle_exit(self: &Arc<Self>, index: usize, generation: u64, outcome: Result<(), String>) {
        let escalation = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(index) else {
                return;
            };
            if slot.generation != generation {
                return;
            }
            if let Some(handle) = slot.handle.take() {
                let _ = handle.join();
            }

            let reason = match outcome {
                Ok(()) => return,
                Err(reason) => reason,
            };
            if self.halted.load(Ordering::SeqCst) || self.failed.load(Ordering::SeqCst) {
                return;
            }

            slot.failures = if slot.progressed { 1 } else { slot.failures + 1 };
            slot.progressed = false;
            log::warn!(
                "Worker {} crashed ({}), consecutive failures: {}",
                index,
                reason,
                slot.failures
            );

            if slot.failures >= MAX_CONSECUTIVE_FAILURES {
                Some((slot.failures, reason))
            } else {
                let failures = slot.failures;
                match self.spawn_slot(index) {
                    Ok(mut restarted) => {
                        restarted.failures = failures;
                        *slot = restarted;
                        None
                    }
                    Err(e) => Some((failures, e.to_string())),
                }
            }
        };

        if let Some((failures, reason)) = escalation {
            self.fail(index, failures, reason);
        }
    }

    /// Stops all work and notifies the fatal callbacks
    fn fail(&self, index: usize, failures: u32, reason: String) {
        {
            let slots = self.slots.lock();
            self.failed.store(true, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            self.publish(slots.len());
            for slot in slots.iter() {
                slot.stop.store(true, Ordering::SeqCst);
            }
        }

        log::error!(
            "Worker {} failed {} times in a row, stopping all workers",
            index,
            failures
        );
        for callback in self.fatal_callbacks.lock().iter() {
            callback(MinerError::WorkerError {
                index,
                failures,
                reason: reason.clone(),
            });
        }
    }

    /// Hands a share to the consumers unless its template was superseded
    /// or the nonce was already delivered
    ///
    /// Pause, resume and resize restart the search of the current template,
    /// so workers find the same nonces again.
    fn deliver(&self, share: Share) {
        let mut delivered = self.delivered.lock();
        let current = self.template.load();
        let is_current = matches!(&*current, Some(template) if template.template_id == share.template_id);
        if !is_current || !self.running.load(Ordering::SeqCst) {
            log::debug!(
                "Dropping stale share from worker {} for template {}",
                share.worker_index,
                share.template_id
            );
            return;
        }
        if !delivered.insert(share.nonce) {
            log::debug!(
                "Dropping repeated nonce {} from worker {} for template {}",
                share.nonce,
                share.worker_index,
                share.template_id
            );
            return;
        }

        log::info!(
            "Worker {} found share for template {} (nonce {})",
            share.worker_index,
            share.template_id,
            share.nonce
        );
        for callback in self.share_callbacks.lock().iter() {
            callback(share.clone());
        }
    }

    fn report_rate(&self, rate: f64) {
        if !self.running.load(Ordering::SeqCst) || self.failed.load(Ordering::SeqCst) {
            return;
        }
        for callback in self.rate_callbacks.lock().iter() {
            callback(rate);
        }
    }
}

/// Supervisor loop: runs until [`WorkerEvent::Halt`]
fn supervise(shared: Arc<Shared>, events: Receiver<WorkerEvent>) {
    let ticker = tick(shared.settings.report_window);
    let mut window_hashes = 0u64;
    let mut window_start = Instant::now();

    loop {
        let first = select! {
            recv(events) -> event => match event {
                Ok(event) => Some(event),
                Err(_) => return,
            },
            recv(ticker) -> _ => None,
        };

        let Some(first) = first else {
            let elapsed = window_start.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                shared.report_rate(window_hashes as f64 / elapsed);
            }
            window_hashes = 0;
            window_start = Instant::now();
            continue;
        };

        let mut halt = false;
        let mut shares = Vec::new();
        for event in std::iter::once(first).chain(events.try_iter()) {
            match event {
                WorkerEvent::Share { share, found_at } => shares.push((found_at, share)),
                WorkerEvent::Sample(sample) => {
                    window_hashes += sample.hashes;
                    shared.mark_progress(sample.worker_index);
                }
                WorkerEvent::Exited {
                    index,
                    generation,
                    outcome,
                } => shared.handle_exit(index, generation, outcome),
                WorkerEvent::Halt => halt = true,
            }
        }

        // Stable: per-worker order survives, equal instants go by worker index
        shares.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.worker_index.cmp(&b.1.worker_index)));
        for (_, share) in shares {
            shared.deliver(share);
        }

        if halt {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::template::DEFAULT_NONCE_RANGE;
    use std::sync::atomic::AtomicUsize;

    /// Zero hash for the winning nonces, 0xff.. otherwise
    struct Scripted {
        winning: Vec<u64>,
    }

    impl Algorithm for Scripted {
        fn hash(&self, _input: &[u8], nonce: u64) -> Result<[u8; 32], MinerError> {
            Ok(if self.winning.contains(&nonce) { [0u8; 32] } else { [0xff; 32] })
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    /// Panics on the first `crashes` calls, then never matches
    struct Flaky {
        crashes: AtomicUsize,
    }

    impl Algorithm for Flaky {
        fn hash(&self, _input: &[u8], _nonce: u64) -> Result<[u8; 32], MinerError> {
            if self
                .crashes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                panic!("simulated crash");
            }
            Ok([0xff; 32])
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn template(id: &str, range: Range<u64>) -> WorkTemplate {
        let mut target = [0u8; 32];
        target[0] = 0x01;
        WorkTemplate {
            template_id: id.into(),
            header: id.as_bytes().to_vec(),
            target,
            block_target: None,
            height: 1,
            nonce_range: range,
        }
    }

    fn fast_settings() -> PoolSettings {
        PoolSettings {
            sample_interval: Duration::from_millis(20),
            report_window: Duration::from_millis(50),
        }
    }

    #[test]
    fn resize_yields_disjoint_covering_ranges() {
        let pool = WorkerPool::new(Arc::new(Scripted { winning: vec![] }), fast_settings()).unwrap();
        pool.set_template(template("a", DEFAULT_NONCE_RANGE));

        for threads in [1usize, 2, 3, 7, 16, 5, 1] {
            pool.start(threads).unwrap();
            assert_eq!(pool.active_workers(), threads);

            let ranges = pool.assignments();
            assert_eq!(ranges.len(), threads);
            assert_eq!(ranges[0].start, DEFAULT_NONCE_RANGE.start);
            assert_eq!(ranges[threads - 1].end, DEFAULT_NONCE_RANGE.end);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
        }
        pool.shutdown();
    }

    #[test]
    fn resize_rejects_zero_threads() {
        let pool = WorkerPool::new(Arc::new(Scripted { winning: vec![] }), fast_settings()).unwrap();
        assert!(matches!(pool.resize(0), Err(MinerError::InputError(_))));
    }

    #[test]
    fn delivers_exactly_one_share_per_solution() {
        let pool = WorkerPool::new(Arc::new(Scripted { winning: vec![777] }), fast_settings()).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        pool.on_share(move |share| {
            let _ = tx.send(share);
        });

        pool.set_template(template("solo", 0..10_000));
        pool.start(4).unwrap();

        let share = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(share.nonce, 777);
        assert_eq!(share.template_id, "solo");
        assert_eq!(share.worker_index, 0);
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        pool.shutdown();
    }

    #[test]
    fn restarted_work_does_not_repeat_shares() {
        let pool = WorkerPool::new(Arc::new(Scripted { winning: vec![777] }), fast_settings()).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        pool.on_share(move |share| {
            let _ = tx.send(share);
        });

        pool.set_template(template("solo", 0..10_000));
        pool.start(4).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().nonce, 777);

        pool.pause();
        pool.start(4).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err(), "repeated after resume");

        pool.resize(3).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err(), "repeated after shrink");

        pool.resize(6).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err(), "repeated after grow");

        // The same template sent again is still the same work
        pool.set_template(template("solo", 0..10_000));
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err(), "repeated after resend");

        // New work: the nonce counts again
        pool.set_template(template("next", 0..10_000));
        let share = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((share.template_id.as_str(), share.nonce), ("next", 777));
        pool.shutdown();
    }

    #[test]
    fn no_share_for_superseded_template_after_switch() {
        // Every nonce wins, so workers produce a steady stream of shares
        let winning: Vec<u64> = (0..200_000).collect();
        let pool = WorkerPool::new(Arc::new(Scripted { winning }), fast_settings()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        pool.on_share(move |share| sink.lock().push(share.template_id));

        pool.start(3).unwrap();
        for round in 0..5 {
            let id = format!("t{}", round);
            pool.set_template(template(&id, 0..200_000));
            let switched_at = seen.lock().len();
            std::thread::sleep(Duration::from_millis(30));

            let after: Vec<String> = seen.lock()[switched_at..].to_vec();
            assert!(after.iter().all(|t| *t == id), "stale share after switch to {id}");
        }
        pool.shutdown();
    }

    #[test]
    fn reports_aggregate_hashrate_while_running() {
        let pool = WorkerPool::new(Arc::new(Scripted { winning: vec![] }), fast_settings()).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        pool.on_hashrate_sample(move |rate| {
            let _ = tx.send(rate);
        });

        pool.set_template(template("rate", DEFAULT_NONCE_RANGE));
        pool.start(2).unwrap();

        let positive = (0..40)
            .filter_map(|_| rx.recv_timeout(Duration::from_secs(1)).ok())
            .any(|rate| rate > 0.0);
        assert!(positive);

        pool.pause();
        assert!(pool.assignments().is_empty());
        pool.shutdown();
    }

    #[test]
    fn crashed_worker_is_restarted_in_place() {
        let pool = WorkerPool::new(
            Arc::new(Flaky { crashes: AtomicUsize::new(1) }),
            fast_settings(),
        )
        .unwrap();
        let fatal = Arc::new(AtomicBool::new(false));
        let flag = fatal.clone();
        pool.on_fatal(move |_| flag.store(true, Ordering::SeqCst));

        pool.set_template(template("flaky", DEFAULT_NONCE_RANGE));
        pool.start(2).unwrap();
        std::thread::sleep(Duration::from_millis(300));

        assert!(!fatal.load(Ordering::SeqCst));
        assert!(pool.is_running());
        assert_eq!(pool.active_workers(), 2);
        pool.shutdown();
    }

    #[test]
    fn repeated_immediate_crashes_are_fatal() {
        let pool = WorkerPool::new(
            Arc::new(Flaky { crashes: AtomicUsize::new(usize::MAX) }),
            fast_settings(),
        )
        .unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        pool.on_fatal(move |e| {
            let _ = tx.send(e);
        });

        pool.set_template(template("doomed", DEFAULT_NONCE_RANGE));
        pool.start(1).unwrap();

        let error = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            error,
            MinerError::WorkerError { index: 0, failures: MAX_CONSECUTIVE_FAILURES, .. }
        ));
        assert!(!pool.is_running());
        assert!(pool.resize(1).is_err());
        pool.shutdown();
    }
}
