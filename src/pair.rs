//! The two sides of a race: [`RacePair`] for thread A, [`RaceB`] for B.
//!
//! Each iteration of a race looks like this on both threads:
//!
//! ```text
//! thread A                      thread B
//! while pair.run_a() {          while race_b.run_b() {
//!     pair.start_race_a();          race_b.start_race_b();
//!     /* racy operation */          /* racy operation */
//!     pair.end_race_a();            race_b.end_race_b();
//! }                             }
//! ```
//!
//! `start_race_*` and `end_race_*` must be called exactly once per
//! iteration, in this order. Nothing checks it, but any other order makes
//! the timings meaningless.
//!
//! Every value both threads access lives in one shared block of atomics.
//! Each of them has a single writer per iteration and is only read by the
//! other thread after the next rendezvous, which orders the accesses.

use crate::budget::{Deadline, TimeBudget};
use crate::config::Config;
use crate::delay::{DelayBias, DelayModel, Phase, Timings};
use crate::error::Error;
use crate::stat::Stat;
use crate::synchronization::Rendezvous;
use crate::thread_b::ThreadB;
use core::hint;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use log::info;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Share of the time budget after which sampling is cut short.
const SAMPLING_SLICE: f64 = 0.5;

#[derive(Debug)]
struct Shared {
    rendezvous: Rendezvous,
    /// Spins of the thread waiting at the end of the race.
    spins: AtomicU64,
    /// Negative delays A, positive delays B. Written by A only.
    delay: AtomicI64,
    delay_bias: DelayBias,
    epoch: Instant,
    b_start: AtomicU64,
    b_end: AtomicU64,
}

impl Shared {
    fn new(yield_in_wait: bool, delay_bias: i64) -> Self {
        Self {
            rendezvous: Rendezvous::new(yield_in_wait),
            spins: AtomicU64::new(0),
            delay: AtomicI64::new(delay_bias),
            delay_bias: DelayBias::new(delay_bias),
            epoch: Instant::now(),
            b_start: AtomicU64::new(0),
            b_end: AtomicU64::new(0),
        }
    }

    /// Nanoseconds since the pair was created.
    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn reset(&self, delay_bias: i64) {
        self.rendezvous.reset();
        self.spins.store(0, Ordering::Relaxed);
        self.delay.store(delay_bias, Ordering::Relaxed);
        self.delay_bias.reset(delay_bias);
        self.b_start.store(0, Ordering::Relaxed);
        self.b_end.store(0, Ordering::Relaxed);
    }

    #[inline(always)]
    fn spin_delay(&self, spins: u64) {
        let yield_in_wait = self.rendezvous.yield_in_wait();
        for _ in 0..spins {
            if yield_in_wait {
                thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }
    }
}

#[inline(always)]
fn diff_ns(t1: u64, t2: u64) -> f64 {
    t1 as f64 - t2 as f64
}

/// Synchronization and timing state of a race, owned by thread A.
///
/// Thread B gets its side through [`RacePair::reset_with_thread_b`] or
/// [`RacePair::thread_b`].
#[derive(Debug)]
pub struct RacePair {
    config: Config,
    shared: Arc<Shared>,
    model: DelayModel,
    budget: Arc<dyn TimeBudget>,
    /// Remaining time when the pair was last reset.
    exec_time_start: Duration,
    exec_loop: u64,
    a_start: u64,
    a_end: u64,
    /// A complete iteration was recorded and not yet folded into the model.
    pending_sample: bool,
    thread_b: Option<ThreadB>,
}

impl RacePair {
    /// Validates `config` and creates a pair whose time budget is
    /// [`Config::runtime`], counted from now.
    pub fn new(config: Config) -> Result<Self, Error> {
        let budget = Arc::new(Deadline::after(config.runtime));
        Self::with_budget(config, budget)
    }

    /// Validates `config` and creates a pair limited by `budget`.
    pub fn with_budget(config: Config, budget: Arc<dyn TimeBudget>) -> Result<Self, Error> {
        config.validate()?;

        let yield_in_wait = config.resolve_yield_in_wait();
        if yield_in_wait {
            info!("Yielding while waiting for the other thread");
        }

        Ok(Self {
            shared: Arc::new(Shared::new(yield_in_wait, config.delay_bias)),
            model: DelayModel::new(&config),
            exec_time_start: budget.remaining(),
            budget,
            config,
            exec_loop: 0,
            a_start: 0,
            a_end: 0,
            pending_sample: false,
            thread_b: None,
        })
    }

    /// Prepares a fresh run without starting a thread.
    ///
    /// Any previous thread B is cleaned up first. Statistics, counters and
    /// the bias start over, and the remaining time budget is recorded.
    pub fn reset(&mut self) {
        self.cleanup();

        let delay_bias = self.config.delay_bias;
        self.model.reset(delay_bias);
        self.shared.reset(delay_bias);
        self.exec_loop = 0;
        self.a_start = 0;
        self.a_end = 0;
        self.pending_sample = false;
        self.exec_time_start = self.budget.remaining();
    }

    /// Like [`RacePair::reset`], then runs `run_b` on a new thread.
    pub fn reset_with_thread_b<F>(&mut self, run_b: F) -> Result<(), Error>
    where
        F: FnOnce(RaceB) + Send + 'static,
    {
        self.reset();
        let thread = ThreadB::spawn(run_b, self.thread_b()).map_err(Error::SpawnThreadB)?;
        self.thread_b = Some(thread);
        Ok(())
    }

    /// The B side, for a thread managed by the caller.
    #[must_use]
    pub fn thread_b(&self) -> RaceB {
        RaceB {
            shared: self.shared.clone(),
        }
    }

    #[must_use]
    pub const fn has_thread_b(&self) -> bool {
        self.thread_b.is_some()
    }

    /// Stops and joins the thread started by
    /// [`RacePair::reset_with_thread_b`], if there is one.
    ///
    /// A thread busy outside of the pair's methods is only joined once it
    /// returns to them.
    pub fn cleanup(&mut self) {
        if let Some(thread) = self.thread_b.take() {
            if !self.exit_requested() {
                info!("Stopping thread B");
                self.request_exit();
            }
            thread.join();
        }
    }

    /// Top of thread A's loop. Returns `false` once the loop must end.
    ///
    /// Requests exit when the time or iteration budget is used up and cuts
    /// sampling short when half of the time budget has passed.
    pub fn run_a(&mut self) -> bool {
        let elapsed = self.elapsed_fraction();

        if self.config.exec_time_p * SAMPLING_SLICE < elapsed && self.model.end_sampling() {
            info!(
                "Stopped sampling at {} (out of {}) samples, sampling time reached {:.0}% of the total time limit, deviation ratios ignored",
                self.exec_loop,
                self.config.min_samples,
                SAMPLING_SLICE * 100.0,
            );
            self.info();
        }

        if elapsed >= self.config.exec_time_p {
            info!("Exceeded execution time, requesting exit");
            self.request_exit();
        }

        self.exec_loop += 1;
        if self.exec_loop > self.config.max_iterations {
            info!("Exceeded execution loops, requesting exit");
            self.request_exit();
        }

        self.shared.rendezvous.wait_a(None);

        if self.exit_requested() {
            self.cleanup();
            return false;
        }

        true
    }

    /// Folds in the last iteration, meets thread B and applies a negative
    /// delay before recording A's start time.
    pub fn start_race_a(&mut self) {
        self.update();
        self.shared.rendezvous.wait_a(None);

        let delay = self.shared.delay.load(Ordering::Relaxed);
        if delay < 0 {
            self.shared.spin_delay(delay.unsigned_abs());
        }

        self.a_start = self.shared.now();
    }

    /// Records A's end time and meets thread B.
    pub fn end_race_a(&mut self) {
        self.a_end = self.shared.now();
        self.pending_sample = true;
        self.shared.rendezvous.wait_a(Some(&self.shared.spins));
    }

    /// An additional synchronization point. Thread B must call
    /// [`RaceB::wait_b`] at the same place in its loop.
    pub fn wait_a(&self) {
        self.shared.rendezvous.wait_a(None);
    }

    fn update(&mut self) {
        let delay = if self.pending_sample {
            let b_start = self.shared.b_start.load(Ordering::Relaxed);
            let b_end = self.shared.b_end.load(Ordering::Relaxed);
            let timings = Timings {
                start_start: diff_ns(self.a_start, b_start),
                a_duration: diff_ns(self.a_end, self.a_start),
                b_duration: diff_ns(b_end, b_start),
                end_end: diff_ns(self.a_end, b_end),
                spins: self.shared.spins.load(Ordering::Relaxed) as f64,
            };
            self.pending_sample = false;
            self.model
                .update(&timings, &self.shared.delay_bias, self.exec_loop)
        } else {
            self.shared.delay_bias.get()
        };

        self.shared.delay.store(delay, Ordering::Relaxed);
        self.shared.spins.store(0, Ordering::Relaxed);
    }

    fn elapsed_fraction(&self) -> f64 {
        let start = self.exec_time_start.as_secs_f64();
        if start <= 0.0 {
            return 1.0;
        }
        1.0 - self.budget.remaining().as_secs_f64() / start
    }

    /// Shifts future delays by `change` spins. Ignored once the model has
    /// stopped sampling.
    pub fn add_bias(&self, change: i64) {
        self.shared.delay_bias.add(change);
    }

    /// Makes both loops end. Every wait returns promptly afterwards.
    pub fn request_exit(&self) {
        self.shared.rendezvous.request_exit();
    }

    #[must_use]
    pub fn exit_requested(&self) -> bool {
        self.shared.rendezvous.exit_requested()
    }

    /// Logs the iteration count, the bias and all statistics.
    pub fn info(&self) {
        self.model.log_info(self.exec_loop, self.delay_bias());
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.model.phase()
    }

    /// Delay of the current iteration, in spins.
    #[must_use]
    pub fn delay(&self) -> i64 {
        self.shared.delay.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn delay_bias(&self) -> i64 {
        self.shared.delay_bias.get()
    }

    /// Iterations started since the last reset.
    #[must_use]
    pub const fn iterations(&self) -> u64 {
        self.exec_loop
    }

    /// Start-start, A duration, B duration, end-end and spins statistics.
    #[must_use]
    pub const fn stats(&self) -> [Stat; 5] {
        self.model.stats()
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for RacePair {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Thread B's side of a [`RacePair`].
#[derive(Debug)]
pub struct RaceB {
    shared: Arc<Shared>,
}

impl RaceB {
    /// Top of thread B's loop. Returns `false` once the loop must end.
    pub fn run_b(&self) -> bool {
        self.shared.rendezvous.wait_b(None);
        !self.exit_requested()
    }

    /// Meets thread A and applies a positive delay before recording B's
    /// start time.
    pub fn start_race_b(&self) {
        self.shared.rendezvous.wait_b(None);

        let delay = self.shared.delay.load(Ordering::Relaxed);
        if delay > 0 {
            self.shared.spin_delay(delay.unsigned_abs());
        }

        self.shared.b_start.store(self.shared.now(), Ordering::Relaxed);
    }

    /// Records B's end time and meets thread A.
    pub fn end_race_b(&self) {
        self.shared.b_end.store(self.shared.now(), Ordering::Relaxed);
        self.shared.rendezvous.wait_b(Some(&self.shared.spins));
    }

    /// Counterpart of [`RacePair::wait_a`].
    pub fn wait_b(&self) {
        self.shared.rendezvous.wait_b(None);
    }

    /// See [`RacePair::add_bias`].
    pub fn add_bias(&self, change: i64) {
        self.shared.delay_bias.add(change);
    }

    pub fn request_exit(&self) {
        self.shared.rendezvous.request_exit();
    }

    #[must_use]
    pub fn exit_requested(&self) -> bool {
        self.shared.rendezvous.exit_requested()
    }

    pub(crate) fn exit_on_panic(&self) -> ExitOnPanic {
        ExitOnPanic {
            shared: self.shared.clone(),
        }
    }
}

/// Requests exit when dropped during a panic, so thread A does not wait
/// for a thread that is gone.
#[derive(Debug)]
pub(crate) struct ExitOnPanic {
    shared: Arc<Shared>,
}

impl Drop for ExitOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.shared.rendezvous.request_exit();
        }
    }
}
