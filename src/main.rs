#![deny(
    clippy::all,
    clippy::cargo,
    clippy::nursery,
    clippy::must_use_candidate,
    clippy::perf
    // clippy::restriction,
    // clippy::pedantic
)]
// now allow a few rules which are denied by the above statement
// --> they are ridiculous and not necessary
#![allow(
    clippy::suboptimal_flops,
    clippy::redundant_pub_crate,
    clippy::fallible_impl_from
)]
#![deny(missing_debug_implementations)]

//! Self-test: races pairs of synthetic critical sections and checks that
//! fuzzy-sync makes them overlap often enough.

use assert2::check;
use clap::Parser;
use fuzzy_sync::{Config, Error, Phase, RacePair};
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Spin iterations per time unit of a [`Window`].
const TIME_SCALE: u32 = 64;

#[derive(Debug, Parser)]
#[command(name = "fuzzy-sync")]
#[command(about = "Races synthetic critical sections with fuzzy-sync")]
#[command(version)]
struct Cli {
    /// Iterations sampled before delays are introduced.
    #[arg(long, default_value = "1024")]
    min_samples: u32,

    /// Iteration limit per race.
    #[arg(long, default_value = "1000000")]
    max_iterations: u64,

    /// Time budget per race, in seconds. Half of it is spent racing.
    #[arg(long, default_value = "10")]
    runtime_secs: u64,

    /// Overlapping iterations a race needs to pass.
    #[arg(long, default_value = "50")]
    min_critical: u64,

    /// Seed of the delay RNG, for reproducible delays.
    #[arg(long)]
    seed: Option<u64>,
}

/// Busy waiting for `units` time units.
fn spin(units: u32) {
    for _ in 0..units * TIME_SCALE {
        hint::spin_loop();
    }
}

/// The race of one thread: the critical section starts `critical_s` units
/// after the race starts and lasts `critical_t`; the race returns
/// `return_t` units after that.
#[derive(Debug, Clone, Copy)]
struct Window {
    critical_s: u32,
    critical_t: u32,
    return_t: u32,
}

impl Window {
    const fn new(critical_s: u32, critical_t: u32, return_t: u32) -> Self {
        Self {
            critical_s,
            critical_t,
            return_t,
        }
    }

    /// Counts an overlap if the other thread is inside its critical section
    /// when this one enters.
    fn run(&self, inside: &AtomicU32, critical: &AtomicU64) {
        spin(self.critical_s);
        if inside.fetch_add(1, Ordering::SeqCst) == 1 {
            critical.fetch_add(1, Ordering::Relaxed);
        }
        spin(self.critical_t);
        inside.fetch_sub(1, Ordering::SeqCst);
        spin(self.return_t);
    }
}

#[derive(Debug, Clone, Copy)]
struct Race {
    a: Window,
    b: Window,
}

const RACES: [Race; 9] = [
    Race {
        a: Window::new(1, 1, 1),
        b: Window::new(1, 1, 1),
    },
    Race {
        a: Window::new(30, 1, 1),
        b: Window::new(1, 1, 1),
    },
    Race {
        a: Window::new(1, 1, 1),
        b: Window::new(30, 1, 1),
    },
    Race {
        a: Window::new(40, 1, 0),
        b: Window::new(1, 1, 20),
    },
    Race {
        a: Window::new(1, 1, 20),
        b: Window::new(40, 1, 0),
    },
    Race {
        a: Window::new(5, 10, 1),
        b: Window::new(1, 1, 1),
    },
    Race {
        a: Window::new(1, 1, 1),
        b: Window::new(5, 10, 1),
    },
    Race {
        a: Window::new(300, 50, 0),
        b: Window::new(100, 50, 0),
    },
    Race {
        a: Window::new(100, 50, 0),
        b: Window::new(300, 50, 0),
    },
];

#[derive(Debug)]
struct Outcome {
    iterations: u64,
    critical: u64,
    phase: Phase,
    delay_bias: i64,
}

/// Runs one race until the pair's budget is used up.
fn run_race(pair: &mut RacePair, race: Race) -> Result<Outcome, Error> {
    let inside = Arc::new(AtomicU32::new(0));
    let critical = Arc::new(AtomicU64::new(0));

    {
        let inside = inside.clone();
        let critical = critical.clone();
        pair.reset_with_thread_b(move |race_b| {
            while race_b.run_b() {
                race_b.start_race_b();
                race.b.run(&inside, &critical);
                race_b.end_race_b();
            }
        })?;
    }

    let mut iterations = 0;
    while pair.run_a() {
        pair.start_race_a();
        race.a.run(&inside, &critical);
        pair.end_race_a();
        iterations += 1;
    }

    Ok(Outcome {
        iterations,
        critical: critical.load(Ordering::Relaxed),
        phase: pair.phase(),
        delay_bias: pair.delay_bias(),
    })
}

fn print_analysis(race: &Race, outcome: &Outcome) {
    println!("A window    : {:?}", race.a);
    println!("B window    : {:?}", race.b);
    println!("Iterations  (#): {}", outcome.iterations);
    println!("  critical  (#): {}", outcome.critical);
    println!("  phase        : {:?}", outcome.phase);
    println!("  delay bias   : {}", outcome.delay_bias);
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    for (i, race) in RACES.iter().enumerate() {
        println!("TEST RUN: race {}/{}", i + 1, RACES.len());

        let mut config = Config::default()
            .with_min_samples(cli.min_samples)
            .with_max_iterations(cli.max_iterations)
            .with_runtime(Duration::from_secs(cli.runtime_secs));
        if let Some(seed) = cli.seed {
            config = config.with_seed(seed);
        }

        let mut pair = RacePair::new(config)?;
        let outcome = run_race(&mut pair, *race)?;
        print_analysis(race, &outcome);
        check!(
            outcome.critical > cli.min_critical,
            "race {} overlapped only {} times",
            i + 1,
            outcome.critical
        );

        println!();
    }

    Ok(())
}
