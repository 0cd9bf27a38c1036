//! The timing model deciding how long one of the threads is delayed.
//!
//! While [`Phase::Sampling`], every iteration feeds five moving averages:
//! the distance between the two start timestamps, both race durations, the
//! distance between the two end timestamps and the number of spins the
//! earlier thread spent waiting for the later one at the end of the race.
//!
//! Once enough samples have been taken and every deviation ratio is small,
//! the model is [`Phase::Armed`]. From then on each iteration draws a random
//! delay covering every relative alignment of the two races, from B's race
//! finishing right when A's starts to A's race finishing right when B's
//! starts. The end-to-end distance divided by the average spin count gives
//! the time one spin takes, which converts that delay into spins.
//!
//! If the two end timestamps coincide there is nothing to derive the spin
//! time from. The model then becomes [`Phase::Stuck`] and only applies the
//! bias.

use crate::config::Config;
use crate::stat::Stat;
use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use log::{info, warn};

/// Overshoot compensating for the loss when converting a time into spins.
const SPIN_OVERSHOOT: f64 = 1.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Collecting statistics; only the bias is applied.
    Sampling,
    /// Statistics are stable; a random delay is drawn every iteration.
    Armed,
    /// No spin time could be derived; only the bias is applied.
    Stuck,
}

/// Timestamp differences of one complete iteration, in nanoseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Timings {
    /// `start_a - start_b`
    pub start_start: f64,
    /// `end_a - start_a`
    pub a_duration: f64,
    /// `end_b - start_b`
    pub b_duration: f64,
    /// `end_a - end_b`
    pub end_end: f64,
    /// Spins of whichever thread waited at the end of the race.
    pub spins: f64,
}

/// Delay offset steered by the race itself, in spins.
///
/// A race which can tell that an iteration went the wrong way may push the
/// delay away from it. Changes are only accepted while the model is
/// sampling, so they shape which samples end up in the averages without
/// fighting the random delay later on.
#[derive(Debug)]
pub struct DelayBias {
    value: AtomicI64,
    accepting: AtomicBool,
}

impl DelayBias {
    #[must_use]
    pub const fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
            accepting: AtomicBool::new(true),
        }
    }

    /// Adds `change` unless the model has stopped sampling.
    pub fn add(&self, change: i64) {
        if self.accepting.load(Ordering::Acquire) {
            self.value.fetch_add(change, Ordering::AcqRel);
        }
    }

    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub(crate) fn reset(&self, initial: i64) {
        self.value.store(initial, Ordering::Release);
        self.accepting.store(true, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct DelayModel {
    alpha: f64,
    max_dev_ratio: f64,
    min_samples: u32,
    /// Mandatory samples left.
    remaining: u32,
    /// Sampling was cut short; arm regardless of the deviation ratios.
    forced: bool,
    phase: Phase,
    diff_ss: Stat,
    diff_sa: Stat,
    diff_sb: Stat,
    diff_ab: Stat,
    spins: Stat,
    delay: i64,
    rng: fastrand::Rng,
}

impl DelayModel {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let rng = config
            .seed
            .map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed);

        Self {
            alpha: config.ema_alpha,
            max_dev_ratio: config.max_dev_ratio,
            min_samples: config.min_samples,
            remaining: config.min_samples,
            forced: false,
            phase: Phase::Sampling,
            diff_ss: Stat::default(),
            diff_sa: Stat::default(),
            diff_sb: Stat::default(),
            diff_ab: Stat::default(),
            spins: Stat::default(),
            delay: config.delay_bias,
            rng,
        }
    }

    /// Back to sampling with fresh statistics. The RNG keeps its state.
    pub fn reset(&mut self, delay_bias: i64) {
        self.remaining = self.min_samples;
        self.forced = false;
        self.phase = Phase::Sampling;
        self.diff_ss = Stat::default();
        self.diff_sa = Stat::default();
        self.diff_sb = Stat::default();
        self.diff_ab = Stat::default();
        self.spins = Stat::default();
        self.delay = delay_bias;
    }

    /// Folds in the last iteration and returns the delay for the next one.
    pub fn update(&mut self, timings: &Timings, bias: &DelayBias, iteration: u64) -> i64 {
        let delay_bias = bias.get();
        self.delay = delay_bias;

        match self.phase {
            Phase::Sampling if self.remaining > 0 || (!self.forced && self.deviating()) => {
                self.feed(timings);
                if self.remaining > 0 {
                    self.remaining -= 1;
                    if self.remaining == 0 {
                        info!("Minimum sampling period ended");
                        self.log_info(iteration, delay_bias);
                    }
                }
            }
            Phase::Sampling => {
                bias.close();
                if self.diff_ab.avg.abs() >= 1.0 {
                    self.phase = Phase::Armed;
                    let per_spin_time = self.per_spin_time();
                    info!(
                        "Reached deviation ratios < {:.2}, introducing randomness",
                        self.max_dev_ratio
                    );
                    info!(
                        "Delay range is [{}, {}]",
                        delay_bias - (self.diff_sb.avg / per_spin_time) as i64,
                        delay_bias + (self.diff_sa.avg / per_spin_time) as i64,
                    );
                    self.log_info(iteration, delay_bias);
                    let random = self.random_delay();
                    self.delay += random;
                } else {
                    self.phase = Phase::Stuck;
                    warn!("Can't calculate random delay");
                    self.log_info(iteration, delay_bias);
                }
            }
            Phase::Armed => {
                let random = self.random_delay();
                self.delay += random;
            }
            Phase::Stuck => {}
        }

        self.delay
    }

    /// Stops mandatory sampling and waives the deviation check, so the next
    /// update arms the model (or finds it stuck).
    ///
    /// Returns `false` if sampling was already over or cut short.
    pub fn end_sampling(&mut self) -> bool {
        if self.phase != Phase::Sampling || self.forced {
            return false;
        }
        self.remaining = 0;
        self.forced = true;
        true
    }

    fn feed(&mut self, timings: &Timings) {
        let alpha = self.alpha;
        self.diff_ss.update(timings.start_start, alpha);
        self.diff_sa.update(timings.a_duration, alpha);
        self.diff_sb.update(timings.b_duration, alpha);
        self.diff_ab.update(timings.end_end, alpha);
        self.spins.update(timings.spins, alpha);
    }

    fn deviating(&self) -> bool {
        self.stats()
            .iter()
            .any(|stat| stat.dev_ratio > self.max_dev_ratio)
    }

    /// Time of one spin. Only meaningful once `|diff_ab.avg| >= 1`.
    fn per_spin_time(&self) -> f64 {
        self.diff_ab.avg.abs() / self.spins.avg.max(1.0)
    }

    fn random_delay(&mut self) -> i64 {
        let per_spin_time = self.per_spin_time();
        let time_delay =
            self.rng.f64() * (self.diff_sa.avg + self.diff_sb.avg) - self.diff_sb.avg;
        (SPIN_OVERSHOOT * time_delay / per_spin_time).round() as i64
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn is_sampling(&self) -> bool {
        self.phase == Phase::Sampling
    }

    /// Delay of the current iteration, in spins.
    #[must_use]
    pub const fn delay(&self) -> i64 {
        self.delay
    }

    #[must_use]
    pub const fn remaining_samples(&self) -> u32 {
        self.remaining
    }

    /// The five tracked statistics: start-start, A duration, B duration,
    /// end-end and spins.
    #[must_use]
    pub const fn stats(&self) -> [Stat; 5] {
        [
            self.diff_ss,
            self.diff_sa,
            self.diff_sb,
            self.diff_ab,
            self.spins,
        ]
    }

    pub fn log_info(&self, iteration: u64, delay_bias: i64) {
        info!("loop = {iteration}, delay_bias = {delay_bias}");
        info!("{}", self.diff_ss.display("start_a - start_b", "ns"));
        info!("{}", self.diff_sa.display("end_a - start_a", "ns"));
        info!("{}", self.diff_sb.display("end_b - start_b", "ns"));
        info!("{}", self.diff_ab.display("end_a - end_b", "ns"));
        info!("{}", self.spins.display("spins", "  "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::check;

    /// Time one delay spin takes in the simulation.
    const SPIN_TIME: f64 = 2.0;

    /// A simulated race: the critical section starts `critical_s` after the
    /// race starts, lasts `critical_t` and the race returns `return_t` later.
    #[derive(Debug, Clone, Copy)]
    struct Window {
        critical_s: f64,
        critical_t: f64,
        return_t: f64,
    }

    impl Window {
        const fn duration(&self) -> f64 {
            self.critical_s + self.critical_t + self.return_t
        }
    }

    #[derive(Debug)]
    struct Outcome {
        timings: Timings,
        a_start: f64,
        b_start: f64,
        a_end: f64,
        b_end: f64,
        overlap: bool,
    }

    /// Both threads leave the start rendezvous at `t = 0`. Only the delayed
    /// one spins; whichever finishes first spins at the end rendezvous until
    /// the other arrives.
    fn simulate(delay: i64, a: Window, b: Window) -> Outcome {
        let a_start = if delay < 0 { -delay as f64 * SPIN_TIME } else { 0.0 };
        let b_start = if delay > 0 { delay as f64 * SPIN_TIME } else { 0.0 };
        let a_end = a_start + a.duration();
        let b_end = b_start + b.duration();

        let a_critical = a_start + a.critical_s;
        let b_critical = b_start + b.critical_s;
        let overlap =
            a_critical < b_critical + b.critical_t && b_critical < a_critical + a.critical_t;

        Outcome {
            timings: Timings {
                start_start: a_start - b_start,
                a_duration: a_end - a_start,
                b_duration: b_end - b_start,
                end_end: a_end - b_end,
                spins: ((a_end - b_end).abs() / SPIN_TIME).floor(),
            },
            a_start,
            b_start,
            a_end,
            b_end,
            overlap,
        }
    }

    fn config() -> Config {
        Config::default().with_seed(0x5eed)
    }

    const A: Window = Window {
        critical_s: 300.0,
        critical_t: 50.0,
        return_t: 0.0,
    };
    const B: Window = Window {
        critical_s: 100.0,
        critical_t: 50.0,
        return_t: 0.0,
    };

    #[test]
    fn stays_sampling_for_min_samples() {
        let config = config();
        let mut model = DelayModel::new(&config);
        let bias = DelayBias::new(0);

        let timings = simulate(0, A, B).timings;
        for i in 0..config.min_samples {
            check!(model.phase() == Phase::Sampling);
            check!(model.update(&timings, &bias, u64::from(i)) == 0);
        }
        check!(model.remaining_samples() == 0);
        check!(model.phase() == Phase::Sampling);

        model.update(&timings, &bias, u64::from(config.min_samples));
        check!(model.phase() == Phase::Armed);
        check!(!bias.is_accepting());
    }

    #[test]
    fn converges_and_overlaps_critical_sections() {
        let config = config();
        let mut model = DelayModel::new(&config);
        let bias = DelayBias::new(0);
        let mut delay = model.delay();
        let mut iteration = 0;

        while model.is_sampling() {
            let outcome = simulate(delay, A, B);
            // Without a delay B's critical section is long over.
            check!(!outcome.overlap);
            iteration += 1;
            delay = model.update(&outcome.timings, &bias, iteration);
            assert!(iteration < 10 * u64::from(config.min_samples));
        }
        check!(model.phase() == Phase::Armed);

        let rounds = 1000;
        let mut critical = 0;
        let (mut min_delay, mut max_delay) = (i64::MAX, i64::MIN);
        for _ in 0..rounds {
            min_delay = min_delay.min(delay);
            max_delay = max_delay.max(delay);
            let outcome = simulate(delay, A, B);
            if outcome.overlap {
                critical += 1;
            }
            iteration += 1;
            delay = model.update(&outcome.timings, &bias, iteration);
        }

        check!(critical > 50, "only {critical} of {rounds} iterations overlapped");
        // Range covers B arriving early as well as A arriving early.
        check!(min_delay < 0);
        check!(max_delay > 0);
        // Statistics are frozen once armed.
        check!(model.phase() == Phase::Armed);
        check!(model.stats()[1].avg > 349.0);
    }

    #[test]
    fn delay_spans_every_alignment() {
        let mut model = DelayModel::new(&config());
        let bias = DelayBias::new(0);
        let timings = simulate(0, A, B).timings;
        for i in 0..=1024 {
            model.update(&timings, &bias, i);
        }
        check!(model.phase() == Phase::Armed);

        // per spin time = 200 / 100 = 2, raw delay in [-150, 350]
        for i in 0..10_000 {
            let delay = model.update(&timings, &bias, 1025 + i);
            check!(delay >= -83);
            check!(delay <= 193);
        }
    }

    #[test]
    fn coinciding_end_times_get_stuck() {
        let mut model = DelayModel::new(&config());
        let bias = DelayBias::new(7);
        let timings = Timings {
            start_start: 0.0,
            a_duration: 200.0,
            b_duration: 200.0,
            end_end: 0.0,
            spins: 0.0,
        };

        for i in 0..2000 {
            let delay = model.update(&timings, &bias, i);
            check!(delay == 7);
        }
        check!(model.phase() == Phase::Stuck);
        check!(model.stats().iter().all(|s| s.avg.is_finite() && s.dev_ratio.is_finite()));
    }

    /// A's duration alternating far below and far above its mean.
    fn jitter(iteration: u64) -> f64 {
        if iteration % 2 == 0 { 70.0 } else { 630.0 }
    }

    #[test]
    fn noisy_samples_keep_sampling() {
        let mut model = DelayModel::new(&config());
        let bias = DelayBias::new(0);
        let mut timings = simulate(0, A, B).timings;

        for i in 0..5000 {
            timings.a_duration = jitter(i);
            model.update(&timings, &bias, i);
        }
        check!(model.phase() == Phase::Sampling);
        check!(model.remaining_samples() == 0);
    }

    #[test]
    fn forced_end_arms_despite_noise() {
        let mut model = DelayModel::new(&config());
        let bias = DelayBias::new(0);
        let mut timings = simulate(0, A, B).timings;

        for i in 0..100 {
            timings.a_duration = jitter(i);
            model.update(&timings, &bias, i);
        }
        check!(model.is_sampling());

        check!(model.end_sampling());
        check!(!model.end_sampling());
        model.update(&timings, &bias, 100);
        check!(model.phase() == Phase::Armed);
    }

    #[test]
    fn start_start_near_zero_waits_for_forced_end() {
        let mut model = DelayModel::new(&config());
        let bias = DelayBias::new(0);
        let mut timings = simulate(0, A, B).timings;

        // Both threads leave the rendezvous together, give or take a few ns.
        for i in 0..5000 {
            timings.start_start = if i % 2 == 0 { 5.0 } else { -5.0 };
            model.update(&timings, &bias, i);
        }
        let stats = model.stats();
        check!(stats[0].avg.abs() < 1.0);
        check!(stats[0].dev_ratio > config().max_dev_ratio);
        check!(stats[1..].iter().all(|s| s.dev_ratio < config().max_dev_ratio));
        check!(model.phase() == Phase::Sampling);

        check!(model.end_sampling());
        model.update(&timings, &bias, 5000);
        check!(model.phase() == Phase::Armed);
    }

    #[test]
    fn reset_returns_to_fresh_sampling() {
        let mut model = DelayModel::new(&config());
        let bias = DelayBias::new(0);
        let timings = simulate(0, A, B).timings;
        for i in 0..=1024 {
            model.update(&timings, &bias, i);
        }
        check!(model.phase() == Phase::Armed);

        model.reset(3);
        bias.reset(3);
        check!(model.phase() == Phase::Sampling);
        check!(model.delay() == 3);
        check!(model.remaining_samples() == 1024);
        check!(model.stats() == [Stat::default(); 5]);
        check!(bias.is_accepting());
    }

    /// Runs a sampling period in which the race pushes B later whenever B
    /// finishes before A reaches its critical section, followed by `rounds`
    /// armed iterations. Returns the final bias and the armed delays.
    fn steered_run(steer: bool, rounds: usize) -> (i64, Vec<i64>) {
        let mut model = DelayModel::new(&config());
        let bias = DelayBias::new(0);
        let mut delay = model.delay();
        let mut iteration = 0;

        while model.is_sampling() {
            let outcome = simulate(delay, A, B);
            if steer && outcome.b_end < outcome.a_start + A.critical_s {
                bias.add(1);
            }
            iteration += 1;
            delay = model.update(&outcome.timings, &bias, iteration);
        }

        let mut delays = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            delays.push(delay);
            let outcome = simulate(delay, A, B);
            if steer && outcome.b_end < outcome.a_end {
                // Ignored once armed.
                bias.add(1);
            }
            iteration += 1;
            delay = model.update(&outcome.timings, &bias, iteration);
        }

        (bias.get(), delays)
    }

    #[test]
    fn bias_steers_sampling_and_shifts_delays() {
        let rounds = 1000;
        let (plain_bias, plain) = steered_run(false, rounds);
        let (steered_bias, steered) = steered_run(true, rounds);

        check!(plain_bias == 0);
        // B is pushed until it finishes when A enters its critical section.
        check!(steered_bias == 75);

        fn mean(delays: &[i64]) -> f64 {
            delays.iter().sum::<i64>() as f64 / delays.len() as f64
        }
        check!(mean(&steered) - mean(&plain) > 25.0);
        check!(plain != steered);
    }

    #[test]
    fn bias_is_frozen_outside_sampling() {
        let bias = DelayBias::new(0);
        bias.add(5);
        bias.add(-2);
        check!(bias.get() == 3);

        bias.close();
        bias.add(100);
        check!(bias.get() == 3);
    }

    #[test]
    fn simulation_is_consistent() {
        let outcome = simulate(-10, A, B);
        check!(outcome.a_start == 20.0);
        check!(outcome.b_start == 0.0);
        check!(outcome.a_end == 370.0);
        check!(outcome.b_end == 150.0);
        check!(outcome.timings.spins == 110.0);
    }
}
