//! Module for the engine-owned second thread. See [`ThreadB`].

use crate::pair::RaceB;
use std::io;
use std::panic;
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};

/// Handle to the thread running the B side of a race.
///
/// Created by [`RacePair::reset_with_thread_b`] and joined exactly once,
/// either by [`RacePair::cleanup`] or when dropped.
///
/// [`RacePair::reset_with_thread_b`]: crate::RacePair::reset_with_thread_b
/// [`RacePair::cleanup`]: crate::RacePair::cleanup
#[derive(Debug)]
pub struct ThreadB {
    handle: Option<JoinHandle<()>>,
}

impl ThreadB {
    fn thread_fn<F: FnOnce(RaceB)>(
        run_b: F,
        race_b: RaceB,
        thread_startup_barrier: Arc<Barrier>,
    ) -> impl FnOnce() {
        move || {
            // Notify caller that thread has started.
            thread_startup_barrier.wait();
            // Releases thread A from its waits should `run_b` panic.
            let _guard = race_b.exit_on_panic();
            run_b(race_b);
        }
    }

    /// Spawns a new thread running `run_b`.
    ///
    /// Returns once the thread has started.
    pub fn spawn<F>(run_b: F, race_b: RaceB) -> io::Result<Self>
    where
        F: FnOnce(RaceB) + Send + 'static,
    {
        let thread_startup_barrier = Arc::new(Barrier::new(2));
        let handle = thread::Builder::new()
            .name("race-b".into())
            .spawn(Self::thread_fn(
                run_b,
                race_b,
                thread_startup_barrier.clone(),
            ))?;

        // Wait for thread to start up.
        thread_startup_barrier.wait();

        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Waits for the thread to return. A panic of the thread is re-raised on
    /// the caller.
    ///
    /// The caller must have requested exit first, otherwise this only
    /// returns once the B loop ends by itself.
    pub fn join(mut self) {
        self.join_inner();
    }

    fn join_inner(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(payload) = handle.join() {
            if !thread::panicking() {
                panic::resume_unwind(payload);
            }
        }
    }
}

impl Drop for ThreadB {
    fn drop(&mut self) {
        self.join_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, RacePair};
    use assert2::check;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn idle(race_b: RaceB) {
        while race_b.run_b() {}
    }

    #[test]
    fn test_thread_lifecycle() {
        let pair = RacePair::new(Config::default()).unwrap();
        let thread = ThreadB::spawn(idle, pair.thread_b()).unwrap();

        pair.request_exit();
        // Test succeeds if this does not get stuck.
        thread.join();
    }

    #[test]
    fn drop_joins_thread() {
        let pair = RacePair::new(Config::default()).unwrap();
        let finished = Arc::new(AtomicBool::new(false));
        let thread = {
            let finished = finished.clone();
            ThreadB::spawn(
                move |race_b| {
                    idle(race_b);
                    finished.store(true, Ordering::SeqCst);
                },
                pair.thread_b(),
            )
            .unwrap()
        };

        pair.request_exit();
        drop(thread);
        check!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn panic_releases_waiting_a() {
        let pair = RacePair::new(Config::default()).unwrap();
        let thread = ThreadB::spawn(|_| panic!("thread B failed"), pair.thread_b()).unwrap();

        // Returns because the panicking thread requested exit.
        pair.wait_a();
        check!(pair.exit_requested());

        let res = panic::catch_unwind(panic::AssertUnwindSafe(|| thread.join()));
        check!(res.is_err());
    }
}
