//! Thread parking permit used by every blocking wait in the crate.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Wake, Waker};
use std::time::Instant;

#[derive(Debug)]
struct ParkerInner {
    notified: AtomicBool,
    mutex: Mutex<()>,
    cvar: Condvar,
}

impl ParkerInner {
    #[inline]
    fn try_consume(&self) -> bool {
        self.notified
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unpark(&self) {
        self.notified.store(true, Ordering::Release);
        // Taking the mutex orders this notify after a concurrent `park` has
        // either seen the permit or started waiting on the condvar.
        drop(self.mutex.lock());
        self.cvar.notify_one();
    }
}

impl Wake for ParkerInner {
    fn wake(self: Arc<Self>) {
        self.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.unpark();
    }
}

/// A single-permit parking primitive for one blocked thread.
///
/// `unpark` stores a permit; `park` consumes it or sleeps until one arrives.
/// A permit stored before `park` is called is never lost. The parker doubles
/// as a [`Waker`] source so gates, retry broadcasts and cancellation signals
/// can all wake the same blocked caller.
#[derive(Debug, Clone)]
pub(crate) struct Parker {
    inner: Arc<ParkerInner>,
}

impl Parker {
    /// Creates a new parker.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ParkerInner {
                notified: AtomicBool::new(false),
                mutex: Mutex::new(()),
                cvar: Condvar::new(),
            }),
        }
    }

    /// Returns a waker that unparks this parker.
    #[must_use]
    pub(crate) fn waker(&self) -> Waker {
        Waker::from(Arc::clone(&self.inner))
    }

    /// Parks the current thread until notified.
    #[cfg(test)]
    pub(crate) fn park(&self) {
        self.park_until(None);
    }

    /// Parks the current thread until notified or until `deadline`.
    ///
    /// Returns immediately if a permit is already stored or the deadline has
    /// already passed. Spurious returns are allowed; callers re-check their
    /// condition in a loop.
    pub(crate) fn park_until(&self, deadline: Option<Instant>) {
        if self.inner.try_consume() {
            return;
        }

        let mut guard = self.inner.mutex.lock();
        while !self.inner.try_consume() {
            match deadline {
                None => self.inner.cvar.wait(&mut guard),
                Some(deadline) => {
                    if self.inner.cvar.wait_until(&mut guard, deadline).timed_out() {
                        // Consume a permit that raced with the timeout.
                        let _ = self.inner.try_consume();
                        return;
                    }
                }
            }
        }
    }

    /// Stores the permit and wakes the parked thread, if any.
    #[cfg(test)]
    pub(crate) fn unpark(&self) {
        self.inner.unpark();
    }
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}
