//! Fuzzy-sync: makes two threads race through their critical sections at
//! the same time, over and over.
//!
//! Two loops, one per thread, meet at busy-wait rendezvous points around
//! their racy operations. Thread A measures how the two races line up,
//! and once the timings are stable it delays one of the two threads by a
//! random number of spins, exploring every possible alignment of the races.
//! See [`pair`] for the calling protocol.

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

pub mod budget;
pub mod config;
pub mod delay;
pub mod error;
pub mod pair;
pub mod stat;
pub mod synchronization;
pub mod thread_b;

pub use budget::{Deadline, TimeBudget};
pub use config::Config;
pub use delay::{DelayBias, DelayModel, Phase, Timings};
pub use error::Error;
pub use pair::{RaceB, RacePair};
pub use stat::Stat;
