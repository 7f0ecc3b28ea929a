//! Realtime substrate over the EVL core.
//!
//! EVL mutexes and events are kernel devices driven through libevl; waiting
//! and waking happen out-of-band, so barrier traffic never drops a worker
//! back into the in-band scheduler. Threads are ordinary pthreads that
//! attach to the EVL core from their own context before first use.
//!
//! The bindings below are declared in-tree and link against `libevl`; only
//! the calls this crate makes are declared. All libevl entry points return
//! `-errno` on failure.

use crate::error::Errno;
use crate::substrate::ThreadSubstrate;
use std::cell::UnsafeCell;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[allow(non_camel_case_types)]
mod ffi {
    use std::os::raw::{c_char, c_int};

    // Opaque storage matching libevl's uapi layout; sized generously so a
    // libevl update cannot overflow them.
    #[repr(C)]
    pub struct evl_mutex {
        _opaque: [u64; 8],
    }

    #[repr(C)]
    pub struct evl_event {
        _opaque: [u64; 8],
    }

    #[repr(C)]
    pub struct evl_sem {
        _opaque: [u64; 8],
    }

    // Built-in clocks are negative pseudo-fds.
    pub const EVL_CLOCK_MONOTONIC: c_int = -(libc::CLOCK_MONOTONIC as c_int);
    pub const EVL_MUTEX_NORMAL: c_int = 0;
    pub const EVL_CLONE_PRIVATE: c_int = 0;
    // T_WOSS: warn on out-of-band to in-band switch.
    pub const EVL_T_WOSS: c_int = 1 << 3;

    #[link(name = "evl")]
    extern "C" {
        pub fn evl_attach_self(fmt: *const c_char, ...) -> c_int;
        pub fn evl_get_self() -> c_int;
        pub fn evl_set_thread_mode(efd: c_int, mask: c_int, oldmask: *mut c_int) -> c_int;

        pub fn evl_create_mutex(
            mutex: *mut evl_mutex,
            clockfd: c_int,
            ceiling: u32,
            flags: c_int,
            fmt: *const c_char,
            ...
        ) -> c_int;
        pub fn evl_lock_mutex(mutex: *mut evl_mutex) -> c_int;
        pub fn evl_unlock_mutex(mutex: *mut evl_mutex) -> c_int;
        pub fn evl_close_mutex(mutex: *mut evl_mutex) -> c_int;

        pub fn evl_create_event(
            event: *mut evl_event,
            clockfd: c_int,
            flags: c_int,
            fmt: *const c_char,
            ...
        ) -> c_int;
        pub fn evl_wait_event(event: *mut evl_event, mutex: *mut evl_mutex) -> c_int;
        pub fn evl_signal_event(event: *mut evl_event) -> c_int;
        pub fn evl_broadcast_event(event: *mut evl_event) -> c_int;
        pub fn evl_close_event(event: *mut evl_event) -> c_int;

        pub fn evl_create_sem(
            sem: *mut evl_sem,
            clockfd: c_int,
            initval: c_int,
            flags: c_int,
            fmt: *const c_char,
            ...
        ) -> c_int;
        pub fn evl_get_sem(sem: *mut evl_sem) -> c_int;
        pub fn evl_put_sem(sem: *mut evl_sem) -> c_int;
        pub fn evl_close_sem(sem: *mut evl_sem) -> c_int;
    }
}

static ELEMENT_SERIAL: AtomicUsize = AtomicUsize::new(0);

// EVL elements are named devices; give each a unique, format-free name.
fn element_name(kind: &str) -> CString {
    let serial = ELEMENT_SERIAL.fetch_add(1, Ordering::Relaxed);
    CString::new(format!("lockstep-{kind}-{}-{serial}", std::process::id()))
        .expect("element name contains no NUL")
}

fn check_fd(rc: i32) -> Result<(), Errno> {
    if rc < 0 {
        Err(-rc)
    } else {
        Ok(())
    }
}

/// Realtime substrate: kernel-backed EVL mutexes, events and semaphores.
pub enum EvlSubstrate {}

impl ThreadSubstrate for EvlSubstrate {
    type Mutex = EvlMutex;
    type Condvar = EvlEvent;
    type Semaphore = EvlSemaphore;

    fn create_mutex() -> Result<EvlMutex, Errno> {
        EvlMutex::new()
    }

    fn lock(mutex: &EvlMutex) {
        let rc = unsafe { ffi::evl_lock_mutex(mutex.raw()) };
        debug_assert_eq!(rc, 0, "evl_lock_mutex failed: {rc}");
    }

    fn unlock(mutex: &EvlMutex) {
        let rc = unsafe { ffi::evl_unlock_mutex(mutex.raw()) };
        debug_assert_eq!(rc, 0, "evl_unlock_mutex failed: {rc}");
    }

    fn create_condvar() -> Result<EvlEvent, Errno> {
        EvlEvent::new()
    }

    fn wait(condvar: &EvlEvent, mutex: &EvlMutex) {
        let rc = unsafe { ffi::evl_wait_event(condvar.raw(), mutex.raw()) };
        debug_assert_eq!(rc, 0, "evl_wait_event failed: {rc}");
    }

    fn signal(condvar: &EvlEvent) {
        let rc = unsafe { ffi::evl_signal_event(condvar.raw()) };
        debug_assert_eq!(rc, 0);
    }

    fn broadcast(condvar: &EvlEvent) {
        let rc = unsafe { ffi::evl_broadcast_event(condvar.raw()) };
        debug_assert_eq!(rc, 0);
    }

    fn create_semaphore(_name: &str) -> Result<EvlSemaphore, Errno> {
        EvlSemaphore::new()
    }

    fn semaphore_wait(sem: &EvlSemaphore) {
        let rc = unsafe { ffi::evl_get_sem(sem.raw()) };
        debug_assert_eq!(rc, 0);
    }

    fn semaphore_post(sem: &EvlSemaphore) {
        let rc = unsafe { ffi::evl_put_sem(sem.raw()) };
        debug_assert_eq!(rc, 0);
    }

    fn attach_current_thread() {
        let name = element_name("worker");
        let rc = unsafe { ffi::evl_attach_self(name.as_ptr()) };
        if rc < 0 {
            log::error!("failed to attach worker thread to the EVL core (errno {})", -rc);
        }
    }

    fn warn_on_mode_switch() {
        unsafe {
            let efd = ffi::evl_get_self();
            if efd >= 0 {
                ffi::evl_set_thread_mode(efd, ffi::EVL_T_WOSS, std::ptr::null_mut());
            }
        }
    }
}

pub struct EvlMutex {
    cell: Box<UnsafeCell<ffi::evl_mutex>>,
}

unsafe impl Send for EvlMutex {}
unsafe impl Sync for EvlMutex {}

impl EvlMutex {
    fn new() -> Result<Self, Errno> {
        let cell = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() }));
        let name = element_name("mutex");
        let rc = unsafe {
            ffi::evl_create_mutex(
                cell.get(),
                ffi::EVL_CLOCK_MONOTONIC,
                0,
                ffi::EVL_MUTEX_NORMAL | ffi::EVL_CLONE_PRIVATE,
                name.as_ptr(),
            )
        };
        check_fd(rc)?;
        Ok(EvlMutex { cell })
    }

    fn raw(&self) -> *mut ffi::evl_mutex {
        self.cell.get()
    }
}

impl Drop for EvlMutex {
    fn drop(&mut self) {
        unsafe {
            ffi::evl_close_mutex(self.cell.get());
        }
    }
}

pub struct EvlEvent {
    cell: Box<UnsafeCell<ffi::evl_event>>,
}

unsafe impl Send for EvlEvent {}
unsafe impl Sync for EvlEvent {}

impl EvlEvent {
    fn new() -> Result<Self, Errno> {
        let cell = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() }));
        let name = element_name("event");
        let rc = unsafe {
            ffi::evl_create_event(
                cell.get(),
                ffi::EVL_CLOCK_MONOTONIC,
                ffi::EVL_CLONE_PRIVATE,
                name.as_ptr(),
            )
        };
        check_fd(rc)?;
        Ok(EvlEvent { cell })
    }

    fn raw(&self) -> *mut ffi::evl_event {
        self.cell.get()
    }
}

impl Drop for EvlEvent {
    fn drop(&mut self) {
        unsafe {
            ffi::evl_close_event(self.cell.get());
        }
    }
}

pub struct EvlSemaphore {
    cell: Box<UnsafeCell<ffi::evl_sem>>,
}

unsafe impl Send for EvlSemaphore {}
unsafe impl Sync for EvlSemaphore {}

impl EvlSemaphore {
    fn new() -> Result<Self, Errno> {
        let cell = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() }));
        let name = element_name("sem");
        let rc = unsafe {
            ffi::evl_create_sem(
                cell.get(),
                ffi::EVL_CLOCK_MONOTONIC,
                0,
                ffi::EVL_CLONE_PRIVATE,
                name.as_ptr(),
            )
        };
        check_fd(rc)?;
        Ok(EvlSemaphore { cell })
    }

    fn raw(&self) -> *mut ffi::evl_sem {
        self.cell.get()
    }
}

impl Drop for EvlSemaphore {
    fn drop(&mut self) {
        unsafe {
            ffi::evl_close_sem(self.cell.get());
        }
    }
}

/// EVL-backed one-shot notification channel. The notify side runs entirely
/// out-of-band: a realtime producer can wake an in-band consumer without a
/// mode switch.
pub(crate) struct EvlConditionVariable {
    mutex: EvlMutex,
    event: EvlEvent,
    notified: AtomicBool,
}

impl EvlConditionVariable {
    pub(crate) fn new() -> Result<Self, Errno> {
        Ok(EvlConditionVariable {
            mutex: EvlMutex::new()?,
            event: EvlEvent::new()?,
            notified: AtomicBool::new(false),
        })
    }

    pub(crate) fn notify(&self) {
        EvlSubstrate::lock(&self.mutex);
        self.notified.store(true, Ordering::Release);
        EvlSubstrate::signal(&self.event);
        EvlSubstrate::unlock(&self.mutex);
    }

    pub(crate) fn wait(&self) -> bool {
        EvlSubstrate::lock(&self.mutex);
        while !self.notified.load(Ordering::Acquire) {
            EvlSubstrate::wait(&self.event, &self.mutex);
        }
        self.notified.store(false, Ordering::Release);
        EvlSubstrate::unlock(&self.mutex);
        true
    }
}
