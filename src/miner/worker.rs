// src/miner/worker.rs
//! Worker thread implementation
//!
//! Each worker owns one OS thread. It reads the published [`Assignment`],
//! derives its own nonce sub-range and hashes through it, checking every
//! [`CHECK_INTERVAL`] nonces whether the assignment was replaced or the
//! worker was told to stop. Found shares and throughput samples go to the
//! pool supervisor over a crossbeam channel.

use crate::miner::algorithm::Algorithm;
use crate::miner::template::{Assignment, HashSample, Share, WorkerEvent};
use crate::utils::error::MinerError;
use arc_swap::ArcSwapOption;
use crossbeam_channel::Sender;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Nonces hashed between two checks of the published assignment
pub const CHECK_INTERVAL: u64 = 1024;

/// Sleep between polls while there is nothing to hash
const IDLE_POLL: Duration = Duration::from_millis(50);

/// A single hashing thread bound to one worker slot
pub struct HashWorker {
    /// Slot index, also used to pick the nonce sub-range
    index: usize,
    /// Incarnation of the slot; bumped on every restart
    generation: u64,
    /// Hash implementation
    algorithm: Arc<dyn Algorithm>,
    /// Assignment published by the pool
    slot: Arc<ArcSwapOption<Assignment>>,
    /// Set when this particular worker must exit
    stop: Arc<AtomicBool>,
    /// Channel to the pool supervisor
    events: Sender<WorkerEvent>,
    /// How often throughput is reported
    sample_interval: Duration,
}

/// Hash counter for the current sampling window
struct Meter {
    hashes: u64,
    since: Instant,
}

impl HashWorker {
    /// Creates a worker for slot `index`
    pub fn new(
        index: usize,
        generation: u64,
        algorithm: Arc<dyn Algorithm>,
        slot: Arc<ArcSwapOption<Assignment>>,
        stop: Arc<AtomicBool>,
        events: Sender<WorkerEvent>,
        sample_interval: Duration,
    ) -> Self {
        HashWorker {
            index,
            generation,
            algorithm,
            slot,
            stop,
            events,
            sample_interval,
        }
    }

    /// Starts the worker on a dedicated thread
    ///
    /// The thread always reports its end through [`WorkerEvent::Exited`];
    /// hash errors and panics are turned into an `Err` outcome there.
    pub fn spawn(self) -> Result<JoinHandle<()>, MinerError> {
        let handle = thread::Builder::new()
            .name(format!("hash-worker-{}", self.index))
            .spawn(move || {
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.run())) {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(payload) => Err(panic_message(payload.as_ref())),
                };
                let _ = self.events.send(WorkerEvent::Exited {
                    index: self.index,
                    generation: self.generation,
                    outcome,
                });
            })?;
        Ok(handle)
    }

    /// The search loop
    ///
    /// Returns when the stop flag is raised. Any hash error aborts the loop.
    pub fn run(&self) -> Result<(), MinerError> {
        let mut meter = Meter {
            hashes: 0,
            since: Instant::now(),
        };

        'assignment: while !self.stopped() {
            let Some(assignment) = self.slot.load_full() else {
                self.report(&mut meter, false)?;
                thread::sleep(IDLE_POLL);
                continue;
            };

            let range = assignment.range_for(self.index);
            let template = &assignment.template;
            log::debug!(
                "Worker {} searching template {} nonces {}..{}",
                self.index,
                template.template_id,
                range.start,
                range.end
            );

            let mut nonce = range.start;
            while nonce < range.end {
                let chunk_end = nonce.saturating_add(CHECK_INTERVAL).min(range.end);
                for candidate in nonce..chunk_end {
                    let hash = self.algorithm.hash(&template.header, candidate)?;
                    if template.meets_target(&hash) {
                        log::debug!(
                            "Worker {} found nonce {} for template {}",
                            self.index,
                            candidate,
                            template.template_id
                        );
                        self.events.send(WorkerEvent::Share {
                            share: Share {
                                template_id: template.template_id.clone(),
                                nonce: candidate,
                                result_hash: hash,
                                worker_index: self.index,
                            },
                            found_at: Instant::now(),
                        })?;
                    }
                }
                meter.hashes += chunk_end - nonce;
                nonce = chunk_end;

                self.report(&mut meter, false)?;
                if self.stopped() || self.current_version() != Some(assignment.version) {
                    continue 'assignment;
                }
            }

            log::debug!(
                "Worker {} exhausted its range for template {}",
                self.index,
                template.template_id
            );
            while !self.stopped() && self.current_version() == Some(assignment.version) {
                self.report(&mut meter, false)?;
                thread::sleep(IDLE_POLL);
            }
        }

        self.report(&mut meter, true)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn current_version(&self) -> Option<u64> {
        match &*self.slot.load() {
            Some(assignment) => Some(assignment.version),
            None => None,
        }
    }

    /// Emits a sample once the interval has elapsed (or unconditionally on `flush`)
    fn report(&self, meter: &mut Meter, flush: bool) -> Result<(), MinerError> {
        let window = meter.since.elapsed();
        if window < self.sample_interval && !(flush && meter.hashes > 0) {
            return Ok(());
        }

        self.events.send(WorkerEvent::Sample(HashSample {
            worker_index: self.index,
            hashes: meter.hashes,
            window,
        }))?;
        meter.hashes = 0;
        meter.since = Instant::now();
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}
