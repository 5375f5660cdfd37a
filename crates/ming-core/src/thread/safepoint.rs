//! Safepoint coordination for stop-the-world pauses
//!
//! The coordinator implements the pause/resume protocol on top of the GC
//! lock. It owns two condition variables:
//!
//! - `pause_cond`: signalled whenever a thread pauses, leaves the runtime or
//!   detaches; the stopping thread waits on it until every attached thread
//!   is paused.
//! - `resume_cond`: signalled when the world resumes; paused threads wait on
//!   it.
//!
//! ## Protocol
//!
//! ```text
//!            pause_all                     all paused
//! Running ─────────────▶ Stopping{by} ─────────────────▶ Stopped{by}
//!    ▲                                                       │
//!    └───────────────────────── resume_all ──────────────────┘
//! ```
//!
//! Mutators cooperate through [`check`](SafepointCoordinator::check), which
//! parks them while a stop is pending, and through
//! [`leave`](SafepointCoordinator::leave) / [`enter`](SafepointCoordinator::enter)
//! around native code. A thread that never polls starves the collector;
//! interpreter loops must call `check` periodically.
//!
//! Every method takes the locked heap state, so the whole protocol can be
//! driven against a bare [`ThreadRegistry`] in tests.

use crate::thread::registry::{ThreadId, ThreadRegistry, ThreadState, ThreadsMut, WorldState};
use parking_lot::{Condvar, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

#[inline]
fn threads<'g, S: ThreadsMut>(guard: &'g mut MutexGuard<'_, S>) -> &'g mut ThreadRegistry {
    S::threads_mut(&mut **guard)
}

fn state_of<S: ThreadsMut>(guard: &mut MutexGuard<'_, S>, id: ThreadId) -> Option<ThreadState> {
    threads(guard).get(id).ok().map(|record| record.state())
}

/// Statistics tracking for safepoint operations
#[derive(Debug, Default)]
pub struct SafepointStats {
    /// Total number of completed stops
    total_stops: AtomicUsize,
    /// Total number of times a mutator parked at a safepoint
    total_parks: AtomicUsize,
    /// Total time spent waiting for threads to pause (microseconds)
    total_wait_time_us: AtomicUsize,
    /// Maximum wait for threads to pause (microseconds)
    max_wait_time_us: AtomicUsize,
}

impl SafepointStats {
    /// Completed stops
    pub fn total_stops(&self) -> usize {
        self.total_stops.load(Ordering::Relaxed)
    }

    /// Mutator parks
    pub fn total_parks(&self) -> usize {
        self.total_parks.load(Ordering::Relaxed)
    }

    /// Total time-to-safepoint in microseconds
    pub fn total_wait_time_us(&self) -> usize {
        self.total_wait_time_us.load(Ordering::Relaxed)
    }

    /// Longest time-to-safepoint in microseconds
    pub fn max_wait_time_us(&self) -> usize {
        self.max_wait_time_us.load(Ordering::Relaxed)
    }

    fn record_wait(&self, elapsed: usize) {
        self.total_stops.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_us.fetch_add(elapsed, Ordering::Relaxed);
        self.max_wait_time_us.fetch_max(elapsed, Ordering::Relaxed);
    }
}

/// Coordinates stop-the-world pauses across attached threads
#[derive(Debug, Default)]
pub struct SafepointCoordinator {
    pause_cond: Condvar,
    resume_cond: Condvar,
    /// Stop requested; read without the lock on the `check` fast path
    pending: AtomicBool,
    /// Statistics
    pub stats: SafepointStats,
}

impl SafepointCoordinator {
    /// Create a new coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast check for a pending stop (single atomic load)
    #[inline(always)]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Register the calling thread once no stop is in progress
    pub fn register<S: ThreadsMut>(&self, guard: &mut MutexGuard<'_, S>) -> ThreadId {
        self.wait_running(guard);
        let id = threads(guard).register();
        tracing::debug!(target: "ming::thread", thread = id.get(), "thread attached");
        id
    }

    /// Remove a thread and wake a stopping thread that may be waiting on it
    pub fn detach<S: ThreadsMut>(&self, guard: &mut MutexGuard<'_, S>, me: ThreadId) {
        if threads(guard).unregister(me).is_some() {
            tracing::debug!(target: "ming::thread", thread = me.get(), "thread detached");
        }
        self.pause_cond.notify_all();
    }

    /// Stop the world
    ///
    /// `me` is the calling thread if it is attached. Returns `true` once
    /// every other attached thread is paused. If another thread is already
    /// stopping the world, the caller parks until that stop is over and
    /// `false` is returned.
    pub fn pause_all<S: ThreadsMut>(
        &self,
        guard: &mut MutexGuard<'_, S>,
        me: Option<ThreadId>,
    ) -> bool {
        if !threads(guard).world().is_running() {
            match me {
                Some(me) => self.park(guard, me),
                None => self.wait_running(guard),
            }
            return false;
        }

        let start = Instant::now();
        {
            let registry = threads(guard);
            registry.set_world(WorldState::Stopping { by: me });
            if let Some(me) = me {
                registry.set_state(me, ThreadState::Paused);
            }
        }
        self.pending.store(true, Ordering::Release);

        while !threads(guard).all_paused() {
            self.pause_cond.wait(guard);
        }
        threads(guard).set_world(WorldState::Stopped { by: me });

        let elapsed = start.elapsed().as_micros() as usize;
        self.stats.record_wait(elapsed);
        tracing::debug!(
            target: "ming::thread",
            threads = threads(guard).thread_count(),
            wait_us = elapsed,
            "world stopped"
        );
        true
    }

    /// Resume the world after a successful [`pause_all`](Self::pause_all)
    ///
    /// # Panics
    ///
    /// Panics if the world was not stopped by `me`.
    pub fn resume_all<S: ThreadsMut>(&self, guard: &mut MutexGuard<'_, S>, me: Option<ThreadId>) {
        let registry = threads(guard);
        assert_eq!(
            registry.world(),
            WorldState::Stopped { by: me },
            "resume_all by a thread that did not stop the world"
        );
        registry.set_world(WorldState::Running);
        if let Some(me) = me {
            registry.set_state(me, ThreadState::Running);
        }
        self.pending.store(false, Ordering::Release);
        self.resume_cond.notify_all();
        tracing::debug!(target: "ming::thread", "world resumed");
    }

    /// Safepoint poll: park while a stop is pending
    pub fn check<S: ThreadsMut>(&self, guard: &mut MutexGuard<'_, S>, me: ThreadId) {
        if !threads(guard).world().is_running() {
            self.park(guard, me);
        }
    }

    /// Mark the thread as outside the runtime
    ///
    /// A stop can complete while the thread runs native code. Leaving a
    /// thread that is already native does nothing.
    pub fn leave<S: ThreadsMut>(&self, guard: &mut MutexGuard<'_, S>, me: ThreadId) {
        if state_of(guard, me) == Some(ThreadState::Native) {
            return;
        }
        threads(guard).set_state(me, ThreadState::Native);
        self.pause_cond.notify_all();
    }

    /// Re-enter the runtime, waiting for any stop in progress to finish
    ///
    /// Entering a thread that is already running does nothing.
    pub fn enter<S: ThreadsMut>(&self, guard: &mut MutexGuard<'_, S>, me: ThreadId) {
        if state_of(guard, me) == Some(ThreadState::Running) {
            return;
        }
        self.wait_running(guard);
        threads(guard).set_state(me, ThreadState::Running);
    }

    fn park<S: ThreadsMut>(&self, guard: &mut MutexGuard<'_, S>, me: ThreadId) {
        threads(guard).set_state(me, ThreadState::Paused);
        self.stats.total_parks.fetch_add(1, Ordering::Relaxed);
        self.pause_cond.notify_all();

        self.wait_running(guard);
        threads(guard).set_state(me, ThreadState::Running);
    }

    fn wait_running<S: ThreadsMut>(&self, guard: &mut MutexGuard<'_, S>) {
        while !threads(guard).world().is_running() {
            self.resume_cond.wait(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct Shared {
        lock: Mutex<ThreadRegistry>,
        coord: SafepointCoordinator,
    }

    fn shared() -> Arc<Shared> {
        Arc::new(Shared {
            lock: Mutex::new(ThreadRegistry::new()),
            coord: SafepointCoordinator::new(),
        })
    }

    #[test]
    fn test_pause_with_no_threads() {
        let s = shared();
        let mut guard = s.lock.lock();
        assert!(s.coord.pause_all(&mut guard, None));
        assert!(s.coord.is_pending());
        assert_eq!(guard.world(), WorldState::Stopped { by: None });
        s.coord.resume_all(&mut guard, None);
        assert!(!s.coord.is_pending());
        assert!(guard.world().is_running());
    }

    #[test]
    fn test_repeated_leave_and_enter_are_noops() {
        let s = shared();
        let mut guard = s.lock.lock();
        let me = s.coord.register(&mut guard);

        s.coord.leave(&mut guard, me);
        s.coord.leave(&mut guard, me);
        assert_eq!(guard.paused_count(), 1);
        assert_eq!(guard.get(me).unwrap().state(), ThreadState::Native);

        s.coord.enter(&mut guard, me);
        s.coord.enter(&mut guard, me);
        assert_eq!(guard.paused_count(), 0);
        assert_eq!(guard.get(me).unwrap().state(), ThreadState::Running);
    }

    #[test]
    fn test_self_pause_counts_caller() {
        let s = shared();
        let mut guard = s.lock.lock();
        let me = s.coord.register(&mut guard);
        assert!(s.coord.pause_all(&mut guard, Some(me)));
        assert_eq!(guard.paused_count(), 1);
        s.coord.resume_all(&mut guard, Some(me));
        assert_eq!(guard.paused_count(), 0);
    }

    #[test]
    fn test_native_thread_does_not_block_pause() {
        let s = shared();
        let mut guard = s.lock.lock();
        let other = s.coord.register(&mut guard);
        s.coord.leave(&mut guard, other);

        assert!(s.coord.pause_all(&mut guard, None));
        s.coord.resume_all(&mut guard, None);

        // Still outside the runtime after the resume
        assert_eq!(guard.paused_count(), 1);
        s.coord.enter(&mut guard, other);
        assert_eq!(guard.paused_count(), 0);
    }

    #[test]
    fn test_pause_waits_for_check() {
        let s = shared();
        let worker_id = {
            let mut guard = s.lock.lock();
            s.coord.register(&mut guard)
        };

        let worker = {
            let s = Arc::clone(&s);
            thread::spawn(move || {
                let mut polls = 0;
                while polls < 1000 {
                    if s.coord.is_pending() {
                        let mut guard = s.lock.lock();
                        s.coord.check(&mut guard, worker_id);
                        break;
                    }
                    polls += 1;
                    thread::sleep(Duration::from_millis(1));
                }
                let mut guard = s.lock.lock();
                s.coord.detach(&mut guard, worker_id);
            })
        };

        {
            let mut guard = s.lock.lock();
            assert!(s.coord.pause_all(&mut guard, None));
            assert!(guard.all_paused());
            s.coord.resume_all(&mut guard, None);
        }

        worker.join().unwrap();
        assert_eq!(s.lock.lock().thread_count(), 0);
        assert_eq!(s.coord.stats.total_stops(), 1);
        assert_eq!(s.coord.stats.total_parks(), 1);
    }

    #[test]
    fn test_detach_releases_pause_waiter() {
        let s = shared();
        let worker_id = {
            let mut guard = s.lock.lock();
            s.coord.register(&mut guard)
        };

        let worker = {
            let s = Arc::clone(&s);
            thread::spawn(move || {
                while !s.coord.is_pending() {
                    thread::yield_now();
                }
                let mut guard = s.lock.lock();
                s.coord.detach(&mut guard, worker_id);
            })
        };

        let mut guard = s.lock.lock();
        assert!(s.coord.pause_all(&mut guard, None));
        assert_eq!(guard.thread_count(), 0);
        s.coord.resume_all(&mut guard, None);
        drop(guard);
        worker.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "did not stop the world")]
    fn test_resume_without_pause_panics() {
        let s = shared();
        let mut guard = s.lock.lock();
        s.coord.resume_all(&mut guard, None);
    }
}
