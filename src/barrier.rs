//! Two-phase barrier triggered from outside.
//!
//! Workers arrive and park; a coordinator thread observes "everyone has
//! arrived" and releases the whole round at once. Arrival and release are
//! guarded by two separate mutex/condvar pairs:
//!
//! - the *coordinator side* guards the arrival count, the participant target
//!   and the active-flag index; workers signal it on the last arrival and
//!   the coordinator sleeps on it in [`TriggeredBarrier::wait_for_all`];
//! - the *thread side* guards the workers' halt wait; the coordinator
//!   broadcasts on it in [`TriggeredBarrier::release_all`].
//!
//! Release is published through a pair of halt flags with an alternating
//! active index. Each worker captures a reference to the round's flag while
//! it still holds the coordinator-side lock, so the flag it spins on is a
//! stable address the coordinator will not touch again until the *next*
//! round: a released worker re-entering [`TriggeredBarrier::arrive_and_wait`]
//! always lands on the other flag.
//!
//! Lock order where both are held: coordinator side first, thread side
//! released first.

use crate::substrate::ThreadSubstrate;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub(crate) struct TriggeredBarrier<S: ThreadSubstrate> {
    coord_mutex: S::Mutex,
    coord_cond: S::Condvar,
    thread_mutex: S::Mutex,
    thread_cond: S::Condvar,

    // Guarded by `coord_mutex`. Atomics only because they are read inside
    // worker wait loops without a compiler-visible lock relation; all
    // writes happen under the mutex.
    arrived: AtomicUsize,
    participants: AtomicUsize,
    active: AtomicUsize,

    // Written by the coordinator during release, read by parked workers.
    // One cache line each so the swap never invalidates the line a worker
    // of the *other* round is spinning on.
    halt_flags: [CachePadded<AtomicBool>; 2],
}

impl<S: ThreadSubstrate> TriggeredBarrier<S> {
    pub(crate) fn new() -> Result<Self, crate::error::Errno> {
        Ok(TriggeredBarrier {
            coord_mutex: S::create_mutex()?,
            coord_cond: S::create_condvar()?,
            thread_mutex: S::create_mutex()?,
            thread_cond: S::create_condvar()?,
            arrived: AtomicUsize::new(0),
            participants: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            halt_flags: [
                CachePadded::new(AtomicBool::new(true)),
                CachePadded::new(AtomicBool::new(true)),
            ],
        })
    }

    /// Worker side: register arrival for this round, then park until the
    /// coordinator releases the round.
    pub(crate) fn arrive_and_wait(&self) {
        S::lock(&self.coord_mutex);
        // The round's flag must be captured under this lock; after unlock
        // the coordinator may swap the active index at any time.
        let halt_flag: &AtomicBool = &self.halt_flags[self.active.load(Ordering::Relaxed)];
        let arrived = self.arrived.load(Ordering::Relaxed) + 1;
        self.arrived.store(arrived, Ordering::Relaxed);
        debug_assert!(arrived <= self.participants.load(Ordering::Relaxed));
        if arrived >= self.participants.load(Ordering::Relaxed) {
            S::signal(&self.coord_cond);
        }
        S::unlock(&self.coord_mutex);

        S::lock(&self.thread_mutex);
        while halt_flag.load(Ordering::Acquire) {
            // Spurious wakeups: the flag is the predicate, not the wake.
            S::wait(&self.thread_cond, &self.thread_mutex);
        }
        S::unlock(&self.thread_mutex);
    }

    /// Coordinator side: block until every participant of the current round
    /// has arrived. Returns immediately if they already have.
    pub(crate) fn wait_for_all(&self) {
        S::lock(&self.coord_mutex);
        while self.arrived.load(Ordering::Relaxed) < self.participants.load(Ordering::Relaxed) {
            S::wait(&self.coord_cond, &self.coord_mutex);
        }
        S::unlock(&self.coord_mutex);
    }

    /// Coordinator side: set the number of workers expected to arrive.
    ///
    /// Safe only while the barrier is quiescent between rounds (in practice:
    /// during `add_worker` after the pool has waited for all workers).
    pub(crate) fn set_participants(&self, participants: usize) {
        S::lock(&self.coord_mutex);
        self.participants.store(participants, Ordering::Relaxed);
        S::unlock(&self.coord_mutex);
    }

    /// Coordinator side: release every parked worker for one round.
    ///
    /// Every participant must have arrived; calling earlier is a programming
    /// error. `arrived` is reset *before* the broadcast and inside the
    /// coordinator-side lock, so a worker racing around into the next
    /// arrival cannot satisfy a stale `wait_for_all`.
    pub(crate) fn release_all(&self) {
        S::lock(&self.coord_mutex);
        debug_assert_eq!(
            self.arrived.load(Ordering::Relaxed),
            self.participants.load(Ordering::Relaxed),
        );

        // Retire the current round's flag and arm the other one.
        let active = self.active.load(Ordering::Relaxed);
        self.halt_flags[active].store(false, Ordering::Release);
        let next = active ^ 1;
        self.active.store(next, Ordering::Relaxed);
        self.halt_flags[next].store(true, Ordering::Release);

        self.arrived.store(0, Ordering::Relaxed);

        // The broadcast is issued with the thread-side mutex held: the
        // realtime substrate's event primitive requires its paired mutex,
        // and on pthreads it keeps wakeup scheduling deterministic.
        S::lock(&self.thread_mutex);
        S::broadcast(&self.thread_cond);
        S::unlock(&self.thread_mutex);
        S::unlock(&self.coord_mutex);
    }
}
