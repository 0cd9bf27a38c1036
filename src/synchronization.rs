//! Busy-wait rendezvous for exactly two threads, A and B.
//!
//! Neither side ever blocks in the kernel. Every wait is a spin loop which
//! optionally yields the processor, so the only latency added to the race
//! is the time it takes to observe the other thread's store.

use core::hint;
use core::sync::atomic::{
    AtomicBool, AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};
use std::thread;

/// An atomic unsigned integer usable as a rendezvous counter.
///
/// The width only decides how often the wrap protocol of [`wait`] runs.
pub trait Counter: Send + Sync {
    type Value: Copy + Ord;

    const ZERO: Self::Value;
    const ONE: Self::Value;
    const MAX: Self::Value;

    fn new(value: Self::Value) -> Self;

    /// Increments the counter and returns the *new* value.
    fn increment(&self) -> Self::Value;

    fn load(&self) -> Self::Value;

    fn store(&self, value: Self::Value);
}

macro_rules! impl_counter {
    ($($atomic:ty => $int:ty),* $(,)?) => {
        $(
            impl Counter for $atomic {
                type Value = $int;

                const ZERO: $int = 0;
                const ONE: $int = 1;
                const MAX: $int = <$int>::MAX;

                fn new(value: $int) -> Self {
                    <$atomic>::new(value)
                }

                #[inline(always)]
                fn increment(&self) -> $int {
                    self.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
                }

                #[inline(always)]
                fn load(&self) -> $int {
                    <$atomic>::load(self, Ordering::Acquire)
                }

                #[inline(always)]
                fn store(&self, value: $int) {
                    <$atomic>::store(self, value, Ordering::Release);
                }
            }
        )*
    };
}

impl_counter!(
    AtomicU8 => u8,
    AtomicU16 => u16,
    AtomicU32 => u32,
    AtomicU64 => u64,
    AtomicUsize => usize,
);

#[inline(always)]
fn spin_once(spins: Option<&AtomicU64>, yield_in_wait: bool) {
    if let Some(spins) = spins {
        spins.fetch_add(1, Ordering::Relaxed);
    }
    if yield_in_wait {
        thread::yield_now();
    } else {
        hint::spin_loop();
    }
}

/// Meets the other thread.
///
/// Increments `other`, then spins while `own` is behind it. The thread that
/// arrives first is the one left behind and waits for the peer to bump its
/// counter. Returns early once `exit` is set.
///
/// When the increment makes `other` reach [`Counter::MAX`] both counters are
/// brought back to zero instead: wait until the peer has also reached the
/// maximum (or already reset us), reset the peer, then wait until we have
/// been reset as well. The counters therefore never overflow, no matter how
/// many iterations are run.
///
/// If `spins` is given, it is incremented once per spin iteration.
#[inline(always)]
pub fn wait<C: Counter>(
    own: &C,
    other: &C,
    spins: Option<&AtomicU64>,
    exit: &AtomicBool,
    yield_in_wait: bool,
) {
    let exiting = || exit.load(Ordering::Acquire);

    if other.increment() == C::MAX {
        loop {
            let ours = own.load();
            if ours == C::ZERO || ours == C::MAX || exiting() {
                break;
            }
            spin_once(spins, yield_in_wait);
        }

        other.store(C::ZERO);

        while own.load() > C::ONE && !exiting() {
            spin_once(spins, yield_in_wait);
        }
    } else {
        while own.load() < other.load() && !exiting() {
            spin_once(spins, yield_in_wait);
        }
    }
}

/// The two counters and the exit flag shared by thread A and thread B.
#[derive(Debug)]
pub struct Rendezvous<C: Counter = AtomicU32> {
    a_cntr: C,
    b_cntr: C,
    exit: AtomicBool,
    yield_in_wait: bool,
}

impl<C: Counter> Rendezvous<C> {
    #[must_use]
    pub fn new(yield_in_wait: bool) -> Self {
        Self {
            a_cntr: C::new(C::ZERO),
            b_cntr: C::new(C::ZERO),
            exit: AtomicBool::new(false),
            yield_in_wait,
        }
    }

    /// Waits for thread B. Must only be called by thread A.
    #[inline(always)]
    pub fn wait_a(&self, spins: Option<&AtomicU64>) {
        wait(
            &self.a_cntr,
            &self.b_cntr,
            spins,
            &self.exit,
            self.yield_in_wait,
        );
    }

    /// Waits for thread A. Must only be called by thread B.
    #[inline(always)]
    pub fn wait_b(&self, spins: Option<&AtomicU64>) {
        wait(
            &self.b_cntr,
            &self.a_cntr,
            spins,
            &self.exit,
            self.yield_in_wait,
        );
    }

    /// Releases every current and future wait.
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn yield_in_wait(&self) -> bool {
        self.yield_in_wait
    }

    /// Current `(a, b)` counter values.
    #[must_use]
    pub fn counters(&self) -> (C::Value, C::Value) {
        (self.a_cntr.load(), self.b_cntr.load())
    }

    /// Zeroes both counters and clears the exit flag.
    ///
    /// Only sound while no thread is inside a wait.
    pub fn reset(&self) {
        self.a_cntr.store(C::ZERO);
        self.b_cntr.store(C::ZERO);
        self.exit.store(false, Ordering::Release);
    }
}
