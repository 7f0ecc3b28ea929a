//! Thread and synchronisation substrate abstraction.
//!
//! The barrier and the workers are generic over a [`ThreadSubstrate`]: a
//! compile-time tag selecting the mutex / condition-variable / semaphore
//! primitives and the per-thread kernel hooks. [`PosixSubstrate`] is the
//! standard implementation over raw pthread objects; the `evl` feature adds
//! a realtime-kernel implementation in [`crate::evl`].
//!
//! Thread creation is shared by all substrates: workers are always plain
//! pthreads launched with explicit FIFO scheduling attributes and a
//! single-CPU affinity mask, and a realtime substrate attaches the thread to
//! its kernel from inside the thread body.

use crate::error::Errno;
use std::cell::UnsafeCell;
use std::ffi::CString;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::time::Duration;

/// Compile-time selection of the underlying synchronisation primitives.
///
/// Implementations are uninhabited tag types; all operations are associated
/// functions so the barrier's hot path monomorphises to direct calls with no
/// virtual dispatch.
///
/// Creation operations report raw OS error codes. Lock/wait/signal
/// operations are infallible at this level: with correctly constructed
/// primitives they only fail on programmer error, which is debug-asserted.
pub trait ThreadSubstrate: 'static {
    type Mutex: Send + Sync;
    type Condvar: Send + Sync;
    type Semaphore: Send + Sync;

    fn create_mutex() -> Result<Self::Mutex, Errno>;
    fn lock(mutex: &Self::Mutex);
    fn unlock(mutex: &Self::Mutex);

    fn create_condvar() -> Result<Self::Condvar, Errno>;
    /// Blocks on `condvar`, atomically releasing `mutex` which must be held
    /// by the caller. May wake spuriously; callers re-check their predicate.
    fn wait(condvar: &Self::Condvar, mutex: &Self::Mutex);
    fn signal(condvar: &Self::Condvar);
    fn broadcast(condvar: &Self::Condvar);

    /// Creates a counting semaphore with initial count zero.
    ///
    /// Not used by the barrier; part of the substrate surface for callers
    /// that need a post/wait primitive with the substrate's realtime
    /// guarantees.
    fn create_semaphore(name: &str) -> Result<Self::Semaphore, Errno>;
    fn semaphore_wait(sem: &Self::Semaphore);
    fn semaphore_post(sem: &Self::Semaphore);

    /// Registers the calling thread with the substrate's scheduler core.
    /// Must be called on a worker thread before it touches any other
    /// substrate primitive. No-op on the standard substrate.
    fn attach_current_thread();

    /// Asks the kernel to flag the calling thread when it drops out of
    /// realtime mode. No-op on the standard substrate.
    fn warn_on_mode_switch();
}

/// Standard substrate: plain pthread mutexes, condition variables and named
/// POSIX semaphores.
pub enum PosixSubstrate {}

impl ThreadSubstrate for PosixSubstrate {
    type Mutex = PthreadMutex;
    type Condvar = PthreadCondvar;
    type Semaphore = PosixSemaphore;

    fn create_mutex() -> Result<PthreadMutex, Errno> {
        PthreadMutex::new()
    }

    fn lock(mutex: &PthreadMutex) {
        let rc = unsafe { libc::pthread_mutex_lock(mutex.raw()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_lock failed: {rc}");
    }

    fn unlock(mutex: &PthreadMutex) {
        let rc = unsafe { libc::pthread_mutex_unlock(mutex.raw()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_unlock failed: {rc}");
    }

    fn create_condvar() -> Result<PthreadCondvar, Errno> {
        PthreadCondvar::new()
    }

    fn wait(condvar: &PthreadCondvar, mutex: &PthreadMutex) {
        let rc = unsafe { libc::pthread_cond_wait(condvar.raw(), mutex.raw()) };
        debug_assert_eq!(rc, 0, "pthread_cond_wait failed: {rc}");
    }

    fn signal(condvar: &PthreadCondvar) {
        let rc = unsafe { libc::pthread_cond_signal(condvar.raw()) };
        debug_assert_eq!(rc, 0);
    }

    fn broadcast(condvar: &PthreadCondvar) {
        let rc = unsafe { libc::pthread_cond_broadcast(condvar.raw()) };
        debug_assert_eq!(rc, 0);
    }

    fn create_semaphore(name: &str) -> Result<PosixSemaphore, Errno> {
        PosixSemaphore::new(name)
    }

    fn semaphore_wait(sem: &PosixSemaphore) {
        // Restart on EINTR; a signal landing on a parked worker must not
        // count as a post.
        loop {
            let rc = unsafe { libc::sem_wait(sem.raw) };
            if rc == 0 || last_errno() != libc::EINTR {
                break;
            }
        }
    }

    fn semaphore_post(sem: &PosixSemaphore) {
        let rc = unsafe { libc::sem_post(sem.raw) };
        debug_assert_eq!(rc, 0);
    }

    fn attach_current_thread() {}

    fn warn_on_mode_switch() {}
}

/// A pthread mutex in stable storage.
///
/// The OS object is boxed so the handle can move while the kernel-visible
/// bytes stay put.
pub struct PthreadMutex {
    cell: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

unsafe impl Send for PthreadMutex {}
unsafe impl Sync for PthreadMutex {}

impl PthreadMutex {
    fn new() -> Result<Self, Errno> {
        let cell = Box::new(UnsafeCell::new(unsafe { mem::zeroed() }));
        let rc = unsafe { libc::pthread_mutex_init(cell.get(), ptr::null()) };
        if rc != 0 {
            return Err(rc);
        }
        Ok(PthreadMutex { cell })
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.cell.get()
    }
}

impl Drop for PthreadMutex {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.cell.get());
        }
    }
}

/// A pthread condition variable in stable storage.
pub struct PthreadCondvar {
    cell: Box<UnsafeCell<libc::pthread_cond_t>>,
}

unsafe impl Send for PthreadCondvar {}
unsafe impl Sync for PthreadCondvar {}

impl PthreadCondvar {
    fn new() -> Result<Self, Errno> {
        let cell = Box::new(UnsafeCell::new(unsafe { mem::zeroed() }));
        let rc = unsafe { libc::pthread_cond_init(cell.get(), ptr::null()) };
        if rc != 0 {
            return Err(rc);
        }
        Ok(PthreadCondvar { cell })
    }

    fn raw(&self) -> *mut libc::pthread_cond_t {
        self.cell.get()
    }
}

impl Drop for PthreadCondvar {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_cond_destroy(self.cell.get());
        }
    }
}

/// A named POSIX semaphore, created with count zero and unlinked on drop.
pub struct PosixSemaphore {
    raw: *mut libc::sem_t,
    name: CString,
}

unsafe impl Send for PosixSemaphore {}
unsafe impl Sync for PosixSemaphore {}

impl PosixSemaphore {
    fn new(name: &str) -> Result<Self, Errno> {
        let name = CString::new(name).map_err(|_| libc::EINVAL)?;
        unsafe {
            // A leftover from a crashed process would hand us its count.
            libc::sem_unlink(name.as_ptr());
            let raw = libc::sem_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            );
            if raw == libc::SEM_FAILED {
                return Err(last_errno());
            }
            Ok(PosixSemaphore { raw, name })
        }
    }
}

impl Drop for PosixSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.raw);
            libc::sem_unlink(self.name.as_ptr());
        }
    }
}

fn last_errno() -> Errno {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL)
}

/// Owned handle to a spawned worker thread.
pub(crate) struct JoinHandle {
    raw: libc::pthread_t,
}

impl JoinHandle {
    /// Joins with a deadline. `Err` carries the raw error, `ETIMEDOUT` when
    /// the thread is still running at the deadline.
    #[cfg(target_os = "linux")]
    pub(crate) fn join_timeout(&self, timeout: Duration) -> Result<(), Errno> {
        unsafe {
            let mut deadline = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline);
            deadline.tv_sec += timeout.as_secs() as libc::time_t;
            deadline.tv_nsec += timeout.subsec_nanos() as libc::c_long;
            if deadline.tv_nsec >= 1_000_000_000 {
                deadline.tv_sec += 1;
                deadline.tv_nsec -= 1_000_000_000;
            }
            let rc = libc::pthread_timedjoin_np(self.raw, ptr::null_mut(), &deadline);
            if rc == 0 {
                Ok(())
            } else {
                Err(rc)
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn join_timeout(&self, _timeout: Duration) -> Result<(), Errno> {
        self.join()
    }

    pub(crate) fn join(&self) -> Result<(), Errno> {
        let rc = unsafe { libc::pthread_join(self.raw, ptr::null_mut()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(rc)
        }
    }

    /// Requests asynchronous cancellation. Safety net only; the pool's
    /// cooperative shutdown is the primary exit path.
    pub(crate) fn cancel(&self) {
        unsafe {
            libc::pthread_cancel(self.raw);
        }
    }
}

extern "C" fn worker_trampoline(arg: *mut libc::c_void) -> *mut libc::c_void {
    let body = unsafe { Box::from_raw(arg as *mut Box<dyn FnOnce() + Send>) };
    if catch_unwind(AssertUnwindSafe(move || (*body)())).is_err() {
        log::error!("worker thread terminated by panic");
    }
    ptr::null_mut()
}

/// Launches a joinable thread with explicit FIFO scheduling at `priority`,
/// pinned to `cpu`. Returns the raw errno from attribute setup or
/// `pthread_create` on failure (`EPERM` without realtime privilege, `EINVAL`
/// for a priority the policy rejects or a CPU outside the process mask).
pub(crate) fn spawn_pinned<F>(priority: i32, cpu: usize, body: F) -> Result<JoinHandle, Errno>
where
    F: FnOnce() + Send + 'static,
{
    let boxed: Box<Box<dyn FnOnce() + Send>> = Box::new(Box::new(body));
    unsafe {
        let mut attr: libc::pthread_attr_t = mem::zeroed();
        let rc = libc::pthread_attr_init(&mut attr);
        if rc != 0 {
            return Err(rc);
        }
        libc::pthread_attr_setdetachstate(&mut attr, libc::PTHREAD_CREATE_JOINABLE);
        libc::pthread_attr_setinheritsched(&mut attr, libc::PTHREAD_EXPLICIT_SCHED);
        libc::pthread_attr_setschedpolicy(&mut attr, libc::SCHED_FIFO);
        let mut param: libc::sched_param = mem::zeroed();
        param.sched_priority = priority;
        let mut rc = libc::pthread_attr_setschedparam(&mut attr, &param);

        #[cfg(target_os = "linux")]
        if rc == 0 {
            let mut cpuset: libc::cpu_set_t = mem::zeroed();
            libc::CPU_ZERO(&mut cpuset);
            libc::CPU_SET(cpu, &mut cpuset);
            rc = libc::pthread_attr_setaffinity_np(
                &mut attr,
                mem::size_of::<libc::cpu_set_t>(),
                &cpuset,
            );
        }
        #[cfg(not(target_os = "linux"))]
        let _ = cpu;

        let mut handle: libc::pthread_t = mem::zeroed();
        if rc == 0 {
            let arg = Box::into_raw(boxed) as *mut libc::c_void;
            rc = libc::pthread_create(&mut handle, &attr, worker_trampoline, arg);
            if rc != 0 {
                // The thread never started; reclaim the body.
                drop(Box::from_raw(arg as *mut Box<dyn FnOnce() + Send>));
            }
        }
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return Err(rc);
        }
        Ok(JoinHandle { raw: handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutex_round_trip() {
        let mutex = PosixSubstrate::create_mutex().unwrap();
        PosixSubstrate::lock(&mutex);
        PosixSubstrate::unlock(&mutex);
    }

    #[test]
    fn semaphore_crosses_threads() {
        let sem = Arc::new(
            PosixSubstrate::create_semaphore(&format!(
                "/lockstep_test_sem_{}",
                std::process::id()
            ))
            .unwrap(),
        );
        let observed = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let sem = Arc::clone(&sem);
            let observed = Arc::clone(&observed);
            thread::spawn(move || {
                PosixSubstrate::semaphore_wait(&sem);
                observed.fetch_add(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(10));
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        PosixSubstrate::semaphore_post(&sem);
        waiter.join().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn condvar_wakes_waiter() {
        struct Shared {
            mutex: PthreadMutex,
            cond: PthreadCondvar,
            ready: AtomicUsize,
        }
        let shared = Arc::new(Shared {
            mutex: PosixSubstrate::create_mutex().unwrap(),
            cond: PosixSubstrate::create_condvar().unwrap(),
            ready: AtomicUsize::new(0),
        });

        let waiter = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                PosixSubstrate::lock(&shared.mutex);
                while shared.ready.load(Ordering::Relaxed) == 0 {
                    PosixSubstrate::wait(&shared.cond, &shared.mutex);
                }
                PosixSubstrate::unlock(&shared.mutex);
            })
        };

        thread::sleep(Duration::from_millis(5));
        PosixSubstrate::lock(&shared.mutex);
        shared.ready.store(1, Ordering::Relaxed);
        PosixSubstrate::signal(&shared.cond);
        PosixSubstrate::unlock(&shared.mutex);
        waiter.join().unwrap();
    }
}
