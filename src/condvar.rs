//! One-shot notification channel from realtime to non-realtime code.
//!
//! A realtime producer calls [`RtConditionVariable::notify`]; a single
//! non-realtime consumer blocks in [`RtConditionVariable::wait`] until a
//! notification has been posted, consuming it. On the realtime substrate
//! the notify side is bounded and page-fault free; the channel exists so
//! realtime threads can wake housekeeping code without leaving realtime
//! mode.
//!
//! Instances draw from a process-wide pool of
//! [`MAX_RT_CONDITION_VARIABLES`] slots (the realtime substrate backs each
//! one with a kernel device). Creation fails with
//! [`Error::LimitExceeded`](crate::Error::LimitExceeded) when the pool is
//! exhausted; dropping an instance frees its slot.

use crate::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// Ceiling on concurrently live [`RtConditionVariable`] instances per
/// process.
pub const MAX_RT_CONDITION_VARIABLES: usize = 64;

static ACTIVE_INSTANCES: AtomicUsize = AtomicUsize::new(0);

/// A one-shot notify/wait channel with at most one waiter.
pub struct RtConditionVariable {
    flavor: CvFlavor,
    _slot: InstanceSlot,
}

enum CvFlavor {
    Standard(StdConditionVariable),
    #[cfg(feature = "evl")]
    Realtime(crate::evl::EvlConditionVariable),
}

impl RtConditionVariable {
    /// Creates a channel for the substrate selected at process level.
    pub fn new() -> Result<Self, Error> {
        let slot = InstanceSlot::acquire()?;

        #[cfg(feature = "evl")]
        if crate::realtime_mode_enabled() {
            let inner = crate::evl::EvlConditionVariable::new().map_err(Error::from_errno)?;
            return Ok(RtConditionVariable {
                flavor: CvFlavor::Realtime(inner),
                _slot: slot,
            });
        }

        Ok(RtConditionVariable {
            flavor: CvFlavor::Standard(StdConditionVariable::default()),
            _slot: slot,
        })
    }

    /// Posts a notification and wakes the waiter if one is blocked.
    /// Realtime-safe on the realtime substrate.
    pub fn notify(&self) {
        match &self.flavor {
            CvFlavor::Standard(cv) => cv.notify(),
            #[cfg(feature = "evl")]
            CvFlavor::Realtime(cv) => cv.notify(),
        }
    }

    /// Blocks until a notification has been posted since the last wait,
    /// consumes it and returns `true`.
    pub fn wait(&self) -> bool {
        match &self.flavor {
            CvFlavor::Standard(cv) => cv.wait(),
            #[cfg(feature = "evl")]
            CvFlavor::Realtime(cv) => cv.wait(),
        }
    }
}

/// RAII claim on one of the process-wide instance slots.
struct InstanceSlot;

impl InstanceSlot {
    fn acquire() -> Result<Self, Error> {
        ACTIVE_INSTANCES
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < MAX_RT_CONDITION_VARIABLES).then_some(count + 1)
            })
            .map(|_| InstanceSlot)
            .map_err(|_| Error::LimitExceeded)
    }
}

impl Drop for InstanceSlot {
    fn drop(&mut self) {
        ACTIVE_INSTANCES.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct StdConditionVariable {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl StdConditionVariable {
    fn notify(&self) {
        *self.notified.lock().unwrap() = true;
        self.cond.notify_one();
    }

    fn wait(&self) -> bool {
        let mut notified = self.notified.lock().unwrap();
        while !*notified {
            notified = self.cond.wait(notified).unwrap();
        }
        *notified = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn notify_before_wait_is_consumed() {
        let cv = RtConditionVariable::new().unwrap();
        cv.notify();
        assert!(cv.wait());
    }

    #[test]
    fn repeated_notifications_collapse_into_one() {
        let cv = RtConditionVariable::new().unwrap();
        cv.notify();
        cv.notify();
        assert!(cv.wait());
        // The second notify arrived before the first wait, so it was
        // absorbed by it: a fresh wait must block again.
        let cv = Arc::new(cv);
        let woke = Arc::new(AtomicBool::new(false));
        let waiter = {
            let cv = Arc::clone(&cv);
            let woke = Arc::clone(&woke);
            thread::spawn(move || {
                cv.wait();
                woke.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!woke.load(Ordering::SeqCst));
        cv.notify();
        waiter.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn waiter_blocks_until_notified() {
        let cv = Arc::new(RtConditionVariable::new().unwrap());
        let woke = Arc::new(AtomicBool::new(false));
        let waiter = {
            let cv = Arc::clone(&cv);
            let woke = Arc::clone(&woke);
            thread::spawn(move || {
                assert!(cv.wait());
                woke.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_micros(500));
        assert!(!woke.load(Ordering::SeqCst));
        cv.notify();
        waiter.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn slots_are_released_on_drop() {
        // Far more create/drop pairs than there are slots: any leak would
        // hit the ceiling long before the loop ends.
        for _ in 0..MAX_RT_CONDITION_VARIABLES * 2 {
            drop(RtConditionVariable::new().unwrap());
        }
    }
}
