//! Worker thread lifecycle.
//!
//! A worker owns one OS thread, pinned to a single CPU and scheduled with
//! the FIFO realtime policy. The thread parks on the shared barrier, runs
//! its callback once per release, and exits cooperatively when the pool's
//! `running` flag goes false. The pool drives teardown; the worker's own
//! drop only fires a cancellation as a last resort.

use crate::barrier::TriggeredBarrier;
use crate::error::Errno;
use crate::pool::PoolOptions;
use crate::substrate::{self, JoinHandle, ThreadSubstrate};
use crate::RealtimeScope;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) type WorkerCallback = Box<dyn FnMut() + Send + 'static>;

pub(crate) struct WorkerThread<S: ThreadSubstrate> {
    barrier: Arc<TriggeredBarrier<S>>,
    running: Arc<AtomicBool>,
    callback: Option<WorkerCallback>,
    handle: Option<JoinHandle>,
    options: PoolOptions,
}

impl<S: ThreadSubstrate> WorkerThread<S> {
    pub(crate) fn new(
        barrier: Arc<TriggeredBarrier<S>>,
        running: Arc<AtomicBool>,
        callback: WorkerCallback,
        options: PoolOptions,
    ) -> Self {
        WorkerThread {
            barrier,
            running,
            callback: Some(callback),
            handle: None,
            options,
        }
    }

    /// Launches the worker thread at `priority` (0–100) pinned to `cpu`.
    /// Returns the raw errno from thread creation on failure; the worker is
    /// then inert and can be dropped.
    pub(crate) fn run(&mut self, priority: i32, cpu: usize) -> Result<(), Errno> {
        if !(0..=100).contains(&priority) {
            return Err(libc::EINVAL);
        }
        let callback = match self.callback.take() {
            Some(callback) => callback,
            None => return Err(libc::EINVAL),
        };

        let barrier = Arc::clone(&self.barrier);
        let running = Arc::clone(&self.running);
        let options = self.options;
        let handle = substrate::spawn_pinned(priority, cpu, move || {
            worker_loop::<S>(barrier, running, callback, options)
        });
        match handle {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(errno) => Err(errno),
        }
    }

    /// Reaps the thread after the pool has flipped `running` and released
    /// the final round. Falls back to cancellation if the thread misses the
    /// deadline.
    pub(crate) fn shutdown_join(&mut self, timeout: Duration) {
        if let Some(handle) = self.handle.take() {
            if let Err(errno) = handle.join_timeout(timeout) {
                log::warn!(
                    "worker thread still running {timeout:?} after shutdown (errno {errno}), cancelling"
                );
                handle.cancel();
                let _ = handle.join();
            }
        }
    }
}

impl<S: ThreadSubstrate> Drop for WorkerThread<S> {
    fn drop(&mut self) {
        // Normally the pool has joined already and this is a no-op.
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }
}

fn worker_loop<S: ThreadSubstrate>(
    barrier: Arc<TriggeredBarrier<S>>,
    running: Arc<AtomicBool>,
    mut callback: WorkerCallback,
    options: PoolOptions,
) {
    // Attach before touching any substrate primitive; the barrier arrival
    // below is the first one.
    S::attach_current_thread();
    let _realtime = RealtimeScope::enter();
    if options.disable_denormals {
        flush_denormals_to_zero();
    }
    if options.break_on_mode_switch {
        S::warn_on_mode_switch();
    }

    loop {
        barrier.arrive_and_wait();
        // Checked after the wait so shutdown is one flag store plus one
        // final release.
        if !running.load(Ordering::Acquire) {
            break;
        }
        callback();
    }
}

/// Configures the calling thread's FPU to flush denormal results to zero.
///
/// Denormal operands trap to microcode on most CPUs and can blow a worker's
/// cycle budget by two orders of magnitude on otherwise cheap DSP code.
pub(crate) fn flush_denormals_to_zero() {
    #[cfg(target_arch = "x86_64")]
    #[allow(deprecated)]
    unsafe {
        use std::arch::x86_64::{_mm_getcsr, _mm_setcsr};
        // MXCSR: FTZ (bit 15) and DAZ (bit 6).
        _mm_setcsr(_mm_getcsr() | 0x8040);
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let mut fpcr: u64;
        std::arch::asm!("mrs {}, fpcr", out(reg) fpcr);
        // FPCR: FZ (bit 24).
        fpcr |= 1 << 24;
        std::arch::asm!("msr fpcr, {}", in(reg) fpcr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::PosixSubstrate;

    fn inert_worker() -> WorkerThread<PosixSubstrate> {
        WorkerThread::new(
            Arc::new(TriggeredBarrier::new().unwrap()),
            Arc::new(AtomicBool::new(true)),
            Box::new(|| {}),
            PoolOptions::default(),
        )
    }

    #[test]
    fn priority_out_of_range_is_rejected() {
        let mut worker = inert_worker();
        assert_eq!(worker.run(-1, 0), Err(libc::EINVAL));
        assert_eq!(worker.run(101, 0), Err(libc::EINVAL));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn denormal_results_are_flushed() {
        flush_denormals_to_zero();
        // Half the smallest normal is subnormal; FTZ turns it into zero.
        let tiny = std::hint::black_box(f32::MIN_POSITIVE);
        assert_eq!(std::hint::black_box(tiny * 0.5), 0.0);
    }
}
