//! Worker pool façade.
//!
//! The pool owns the barrier, the workers, and the per-core occupancy used
//! for automatic placement. The coordinator drives cycles through
//! [`WorkerPool::wait_for_workers_idle`] and [`WorkerPool::wakeup_workers`];
//! dropping the pool shuts the workers down cooperatively.
//!
//! The substrate is chosen once, at construction, from the process-wide
//! realtime flag: standard pools map logical core indices onto the CPUs the
//! process may run on, realtime pools map them onto the kernel's
//! isolated-CPU list.

use crate::barrier::TriggeredBarrier;
use crate::error::Error;
use crate::substrate::{PosixSubstrate, ThreadSubstrate};
use crate::worker::{WorkerCallback, WorkerThread};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scheduling priority used by [`WorkerPool::add_worker`].
pub const DEFAULT_WORKER_PRIORITY: i32 = 75;

/// How long the pool waits for a worker to exit cooperatively before
/// cancelling it.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-pool worker configuration.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Flush denormal float results to zero on every worker thread.
    pub disable_denormals: bool,
    /// On the realtime substrate, ask the kernel to warn when a worker
    /// drops out of realtime mode. Ignored on the standard substrate.
    pub break_on_mode_switch: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            disable_denormals: true,
            break_on_mode_switch: false,
        }
    }
}

/// A pool of CPU-pinned realtime worker threads driven in lockstep.
///
/// Workers are added while the pool is quiescent; each cycle the
/// coordinator calls [`wait_for_workers_idle`](Self::wait_for_workers_idle)
/// and then [`wakeup_workers`](Self::wakeup_workers), and every callback
/// runs exactly once per cycle.
pub struct WorkerPool {
    flavor: PoolFlavor,
}

enum PoolFlavor {
    Standard(PoolCore<PosixSubstrate>),
    #[cfg(feature = "evl")]
    Realtime(PoolCore<crate::evl::EvlSubstrate>),
}

impl WorkerPool {
    /// Creates a pool that will place workers on `cores` CPUs, with default
    /// options.
    ///
    /// # Panics
    ///
    /// Panics on fatal initialisation errors: `cores == 0`, more cores than
    /// the substrate can map (the process CPU mask, or the isolated-CPU
    /// list on a realtime kernel), or failure to create the substrate's
    /// synchronisation primitives.
    pub fn new(cores: usize) -> Self {
        Self::with_options(cores, PoolOptions::default())
    }

    /// Creates a pool with explicit [`PoolOptions`].
    ///
    /// # Panics
    ///
    /// As [`WorkerPool::new`].
    pub fn with_options(cores: usize, options: PoolOptions) -> Self {
        assert!(cores > 0, "worker pool needs at least one core");

        #[cfg(feature = "evl")]
        if crate::realtime_mode_enabled() {
            let isolated = crate::isolation::isolated_cpus()
                .expect("realtime worker pool requires isolated cpus in the kernel");
            assert!(
                cores <= isolated.len(),
                "requested {cores} cores but only {} cpus are isolated",
                isolated.len()
            );
            let core_map = isolated[..cores].to_vec();
            log::debug!("realtime pool cores: {core_map:?}");
            return WorkerPool {
                flavor: PoolFlavor::Realtime(PoolCore::new(core_map, options)),
            };
        }
        #[cfg(not(feature = "evl"))]
        if crate::realtime_mode_enabled() {
            log::warn!(
                "realtime mode is enabled but this build has no realtime substrate; \
                 using the standard substrate"
            );
        }

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        assert!(
            cores <= core_ids.len(),
            "requested {cores} cores but only {} are available to this process",
            core_ids.len()
        );
        let core_map: Vec<usize> = core_ids.iter().take(cores).map(|core| core.id).collect();
        log::debug!("worker pool cores: {core_map:?}");
        WorkerPool {
            flavor: PoolFlavor::Standard(PoolCore::new(core_map, options)),
        }
    }

    /// Adds a worker with the default priority and automatic placement.
    ///
    /// The callback runs exactly once per cycle, on its own pinned realtime
    /// thread. Returns once the new worker has parked on the barrier, so a
    /// following [`wakeup_workers`](Self::wakeup_workers) cannot race ahead
    /// of it. Must only be called while the pool is quiescent (before the
    /// first wakeup, or after `wait_for_workers_idle` has returned).
    pub fn add_worker<F>(&mut self, callback: F) -> Result<(), Error>
    where
        F: FnMut() + Send + 'static,
    {
        self.add_worker_with(callback, DEFAULT_WORKER_PRIORITY, None)
    }

    /// Adds a worker with an explicit FIFO `priority` (0–100) and, if
    /// `cpu` is given, a fixed logical core index instead of automatic
    /// placement.
    ///
    /// On failure the pool is left exactly as before the call.
    pub fn add_worker_with<F>(
        &mut self,
        callback: F,
        priority: i32,
        cpu: Option<usize>,
    ) -> Result<(), Error>
    where
        F: FnMut() + Send + 'static,
    {
        let callback: WorkerCallback = Box::new(callback);
        match &mut self.flavor {
            PoolFlavor::Standard(core) => core.add_worker(callback, priority, cpu),
            #[cfg(feature = "evl")]
            PoolFlavor::Realtime(core) => core.add_worker(callback, priority, cpu),
        }
    }

    /// Blocks until every worker is parked on the barrier. Returns
    /// immediately if they already are. Must be called between every pair
    /// of wakeups.
    pub fn wait_for_workers_idle(&self) {
        match &self.flavor {
            PoolFlavor::Standard(core) => core.barrier.wait_for_all(),
            #[cfg(feature = "evl")]
            PoolFlavor::Realtime(core) => core.barrier.wait_for_all(),
        }
    }

    /// Releases every parked worker for one cycle. All workers must be
    /// parked (a preceding [`wait_for_workers_idle`](Self::wait_for_workers_idle)
    /// has returned).
    pub fn wakeup_workers(&self) {
        match &self.flavor {
            PoolFlavor::Standard(core) => core.barrier.release_all(),
            #[cfg(feature = "evl")]
            PoolFlavor::Realtime(core) => core.barrier.release_all(),
        }
    }

    /// Number of workers currently in the pool.
    pub fn worker_count(&self) -> usize {
        match &self.flavor {
            PoolFlavor::Standard(core) => core.workers.len(),
            #[cfg(feature = "evl")]
            PoolFlavor::Realtime(core) => core.workers.len(),
        }
    }
}

struct PoolCore<S: ThreadSubstrate> {
    running: Arc<AtomicBool>,
    barrier: Arc<TriggeredBarrier<S>>,
    workers: Vec<WorkerThread<S>>,
    core_usage: Vec<u32>,
    // Logical worker slot -> physical CPU index.
    core_map: Vec<usize>,
    options: PoolOptions,
}

impl<S: ThreadSubstrate> PoolCore<S> {
    fn new(core_map: Vec<usize>, options: PoolOptions) -> Self {
        let barrier = TriggeredBarrier::new()
            .unwrap_or_else(|errno| panic!("failed to create barrier primitives (errno {errno})"));
        PoolCore {
            running: Arc::new(AtomicBool::new(true)),
            barrier: Arc::new(barrier),
            workers: Vec::new(),
            core_usage: vec![0; core_map.len()],
            core_map,
            options,
        }
    }

    fn add_worker(
        &mut self,
        callback: WorkerCallback,
        priority: i32,
        cpu: Option<usize>,
    ) -> Result<(), Error> {
        let logical = match cpu {
            Some(index) => {
                if index >= self.core_map.len() {
                    return Err(Error::InvalidArguments);
                }
                index
            }
            None => least_loaded_core(&self.core_usage),
        };
        self.core_usage[logical] += 1;

        let mut worker = WorkerThread::new(
            Arc::clone(&self.barrier),
            Arc::clone(&self.running),
            callback,
            self.options,
        );
        self.barrier.set_participants(self.workers.len() + 1);
        match worker.run(priority, self.core_map[logical]) {
            Ok(()) => {
                self.workers.push(worker);
                // Block until the new worker has parked; otherwise the next
                // wakeup could fire while it is still on its way to the
                // barrier.
                self.barrier.wait_for_all();
                Ok(())
            }
            Err(errno) => {
                self.barrier.set_participants(self.workers.len());
                self.core_usage[logical] -= 1;
                Err(Error::from_errno(errno))
            }
        }
    }
}

impl<S: ThreadSubstrate> Drop for PoolCore<S> {
    fn drop(&mut self) {
        // Quiesce, flip the flag, then release once: every worker wakes,
        // observes `running == false` and exits its loop.
        self.barrier.wait_for_all();
        self.running.store(false, Ordering::Release);
        self.barrier.release_all();
        for worker in &mut self.workers {
            worker.shutdown_join(SHUTDOWN_JOIN_TIMEOUT);
        }
    }
}

/// Picks the least-occupied core. The scan runs from the top index down and
/// updates on `<=`, so ties land on the lowest index.
fn least_loaded_core(usage: &[u32]) -> usize {
    let mut min_index = usage.len() - 1;
    let mut min_usage = usage[min_index];
    for index in (0..usage.len()).rev() {
        if usage[index] <= min_usage {
            min_usage = usage[index];
            min_index = index;
        }
    }
    min_index
}
