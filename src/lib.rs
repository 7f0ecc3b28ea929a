//! # lockstep: a synchronised realtime worker pool
//!
//! Runs a fixed set of worker callbacks on dedicated, CPU-pinned,
//! FIFO-scheduled threads, coordinated cycle by cycle from an external
//! driver thread (typically an audio callback). Each cycle the driver
//! releases all workers at once, every callback runs exactly once, and the
//! driver waits until all workers are parked again before the next cycle.
//! The point is not throughput but deterministic, low-jitter coordination.
//!
//! ## Architecture
//!
//! - **[`WorkerPool`]**: owns the workers, places them across CPUs, and
//!   exposes the cycle drive (`wait_for_workers_idle` / `wakeup_workers`).
//! - **Triggered barrier** (internal): the two-phase rendezvous coupling N
//!   workers to one coordinator.
//! - **[`substrate`]**: the thread/sync primitive layer. The standard
//!   substrate uses plain pthreads; with the `evl` cargo feature and
//!   [`init_realtime`] the pool runs on EVL kernel primitives instead.
//! - **[`RtConditionVariable`]**: a one-shot channel for waking
//!   non-realtime code from a realtime thread.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use lockstep::WorkerPool;
//!
//! let mut pool = WorkerPool::new(2);
//! let frames = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&frames);
//! pool.add_worker(move || {
//!     counter.fetch_add(1, Ordering::Relaxed);
//! }).unwrap();
//!
//! // One cycle, driven from the coordinator:
//! pool.wait_for_workers_idle();
//! pool.wakeup_workers();
//! pool.wait_for_workers_idle();
//! assert_eq!(frames.load(Ordering::Relaxed), 1);
//! ```

pub mod error;
pub mod isolation;
pub mod substrate;

mod barrier;
mod condvar;
#[cfg(feature = "evl")]
pub mod evl;
mod pool;
mod worker;

pub use condvar::{RtConditionVariable, MAX_RT_CONDITION_VARIABLES};
pub use error::Error;
pub use pool::{PoolOptions, WorkerPool, DEFAULT_WORKER_PRIORITY};

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

static REALTIME_MODE: AtomicBool = AtomicBool::new(false);

/// Switches the process to the realtime substrate for every pool and
/// condition variable created afterwards. Call before creating any pool;
/// idempotent. Without the `evl` cargo feature this only logs a warning at
/// pool creation and the standard substrate keeps being used.
pub fn init_realtime() {
    REALTIME_MODE.store(true, Ordering::Release);
}

pub(crate) fn realtime_mode_enabled() -> bool {
    REALTIME_MODE.load(Ordering::Acquire)
}

thread_local! {
    // Depth, not a boolean: nested scopes must not clear the flag early.
    static REALTIME_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether the calling thread is a realtime worker thread.
///
/// True inside any worker callback, false everywhere else (including the
/// thread that built the pool, unless it was itself promoted).
pub fn is_current_thread_realtime() -> bool {
    REALTIME_DEPTH.with(|depth| depth.get() > 0)
}

/// Marks the current thread realtime for the lifetime of the guard.
/// Entered by worker threads on startup.
pub(crate) struct RealtimeScope;

impl RealtimeScope {
    pub(crate) fn enter() -> RealtimeScope {
        REALTIME_DEPTH.with(|depth| depth.set(depth.get() + 1));
        RealtimeScope
    }
}

impl Drop for RealtimeScope {
    fn drop(&mut self) {
        REALTIME_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_threads_are_not_realtime() {
        assert!(!is_current_thread_realtime());
    }

    #[test]
    fn scope_flags_the_current_thread_only() {
        let scope = RealtimeScope::enter();
        assert!(is_current_thread_realtime());

        let other = std::thread::spawn(is_current_thread_realtime);
        assert!(!other.join().unwrap());

        drop(scope);
        assert!(!is_current_thread_realtime());
    }

    #[test]
    fn nested_scopes_unwind_in_order() {
        let outer = RealtimeScope::enter();
        let inner = RealtimeScope::enter();
        drop(inner);
        assert!(is_current_thread_realtime());
        drop(outer);
        assert!(!is_current_thread_realtime());
    }
}
