//! Tunables of a [`RacePair`](crate::RacePair).

use crate::error::Error;
use std::thread;
use std::time::Duration;

/// Configuration, validated by [`RacePair::new`](crate::RacePair::new).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Weight of a new sample in the moving averages, in `(0, 1]`.
    pub ema_alpha: f64,
    /// Iterations sampled before a delay may be introduced, at least 20.
    pub min_samples: u32,
    /// All deviation ratios must be below this before the delay is armed,
    /// in `(0, 1)`.
    ///
    /// The start to start distance of two threads released by the same
    /// rendezvous averages close to zero, so its ratio is large and rarely
    /// drops below this bound on real hardware. Such races usually keep
    /// sampling until half of the time share in [`Config::exec_time_p`] has
    /// passed, which arms the delay regardless of the ratios.
    pub max_dev_ratio: f64,
    /// Proportion of the remaining time budget the race may use, in `(0, 1]`.
    /// Sampling is cut short after half of it.
    pub exec_time_p: f64,
    /// Iterations after which `run_a` requests exit, at least 20.
    pub max_iterations: u64,
    /// Initial delay bias, in spins. Negative delays A, positive delays B.
    pub delay_bias: i64,
    /// Yield instead of busy spinning while waiting. `None` enables it on
    /// machines with a single CPU.
    pub yield_in_wait: Option<bool>,
    /// Time budget used when none is supplied by the caller.
    pub runtime: Duration,
    /// Seed of the delay RNG. `None` picks a random one.
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ema_alpha: 0.25,
            min_samples: 1024,
            max_dev_ratio: 0.1,
            exec_time_p: 0.5,
            max_iterations: 3_000_000,
            delay_bias: 0,
            yield_in_wait: None,
            runtime: Duration::from_secs(150),
            seed: None,
        }
    }
}

impl Config {
    #[must_use]
    pub const fn with_ema_alpha(mut self, ema_alpha: f64) -> Self {
        self.ema_alpha = ema_alpha;
        self
    }

    #[must_use]
    pub const fn with_min_samples(mut self, min_samples: u32) -> Self {
        self.min_samples = min_samples;
        self
    }

    #[must_use]
    pub const fn with_max_dev_ratio(mut self, max_dev_ratio: f64) -> Self {
        self.max_dev_ratio = max_dev_ratio;
        self
    }

    #[must_use]
    pub const fn with_exec_time_p(mut self, exec_time_p: f64) -> Self {
        self.exec_time_p = exec_time_p;
        self
    }

    #[must_use]
    pub const fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    #[must_use]
    pub const fn with_delay_bias(mut self, delay_bias: i64) -> Self {
        self.delay_bias = delay_bias;
        self
    }

    #[must_use]
    pub const fn with_yield_in_wait(mut self, yield_in_wait: bool) -> Self {
        self.yield_in_wait = Some(yield_in_wait);
        self
    }

    #[must_use]
    pub const fn with_runtime(mut self, runtime: Duration) -> Self {
        self.runtime = runtime;
        self
    }

    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Checks every bound and reports the first violation.
    pub fn validate(&self) -> Result<(), Error> {
        check_range(
            "ema_alpha",
            self.ema_alpha,
            self.ema_alpha > 0.0 && self.ema_alpha <= 1.0,
            "0 < ema_alpha <= 1",
        )?;
        check_range(
            "min_samples",
            self.min_samples,
            self.min_samples >= 20,
            "min_samples >= 20",
        )?;
        check_range(
            "max_dev_ratio",
            self.max_dev_ratio,
            self.max_dev_ratio > 0.0 && self.max_dev_ratio < 1.0,
            "0 < max_dev_ratio < 1",
        )?;
        check_range(
            "exec_time_p",
            self.exec_time_p,
            self.exec_time_p > 0.0 && self.exec_time_p <= 1.0,
            "0 < exec_time_p <= 1",
        )?;
        check_range(
            "max_iterations",
            self.max_iterations,
            self.max_iterations >= 20,
            "max_iterations >= 20",
        )
    }

    /// Whether waits should yield, resolving `None` from the CPU count.
    #[must_use]
    pub fn resolve_yield_in_wait(&self) -> bool {
        self.yield_in_wait.unwrap_or_else(|| cpus_available() <= 1)
    }
}

fn check_range(
    field: &'static str,
    value: impl ToString,
    in_range: bool,
    bound: &'static str,
) -> Result<(), Error> {
    if in_range {
        Ok(())
    } else {
        Err(Error::InvalidConfig {
            field,
            value: value.to_string(),
            bound,
        })
    }
}

/// CPUs this process may run on. Falls back to 1 if unknown.
#[must_use]
pub fn cpus_available() -> usize {
    thread::available_parallelism().map_or(1, std::num::NonZero::get)
}
