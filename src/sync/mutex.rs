//! Cancellation-aware mutual exclusion.
//!
//! [`RawMutex`] is the bare lock: one [`Gate`] whose token means "unlocked".
//! [`Mutex`] pairs it with the protected data and releases on guard drop.
//!
//! # Example
//!
//! ```
//! use cxlock::{CancelToken, Mutex};
//! use std::time::Duration;
//!
//! let mutex = Mutex::new(42);
//! let cancel = CancelToken::with_timeout(Duration::from_secs(1));
//!
//! let mut guard = mutex.lock(&cancel)?;
//! *guard += 1;
//! # Ok::<(), cxlock::LockError>(())
//! ```

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

use crate::cancel::Cancel;
use crate::error::{LockError, TryLockError};
use crate::sync::gate::Gate;

/// A mutex without data whose `lock` races a cancellation signal.
///
/// Unlocking is explicit and may happen on any thread. It is not re-entrant:
/// locking twice from the same thread blocks until the signal fires.
#[derive(Debug, Default)]
pub struct RawMutex {
    gate: Gate,
}

impl RawMutex {
    /// Creates an unlocked mutex.
    #[must_use]
    pub fn new() -> Self {
        Self { gate: Gate::new() }
    }

    /// Locks the mutex, blocking until it is free or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Cancelled`] if the signal fired first, in which
    /// case the mutex is not held by this caller.
    pub fn lock<C: Cancel + ?Sized>(&self, cancel: &C) -> Result<(), LockError> {
        self.gate.acquire(cancel).map_err(LockError::Cancelled)
    }

    /// Locks the mutex if doing so would not block.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.gate.try_acquire()
    }

    /// Unlocks the mutex, waking one blocked `lock` call.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is not locked.
    pub fn unlock(&self) {
        if !self.gate.try_release() {
            tracing::error!("unlock of a mutex that is not locked");
            panic!("mutex is not locked");
        }
    }

    /// Returns true if the mutex is currently locked.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        !self.gate.is_available()
    }

    /// Returns the number of threads currently waiting for the lock.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.gate.waiters()
    }
}

/// A cancellation-aware mutex protecting a value.
pub struct Mutex<T> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialised by `raw`.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Returns true if the mutex is currently locked.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Returns the number of threads currently waiting for the lock.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.raw.waiters()
    }

    /// Locks the mutex, blocking until it is free or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Cancelled`] if the signal fired first.
    pub fn lock<C: Cancel + ?Sized>(&self, cancel: &C) -> Result<MutexGuard<'_, T>, LockError> {
        self.raw.lock(cancel)?;
        Ok(MutexGuard { mutex: self })
    }

    /// Tries to lock the mutex without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TryLockError::Locked`] if the mutex is held.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, TryLockError> {
        if self.raw.try_lock() {
            Ok(MutexGuard { mutex: self })
        } else {
            Err(TryLockError::Locked)
        }
    }

    /// Returns a mutable reference to the underlying data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Ok(guard) => d.field("data", &&*guard),
            Err(_) => d.field("data", &format_args!("<locked>")),
        };
        d.finish_non_exhaustive()
    }
}

/// A guard that releases the mutex when dropped.
#[must_use = "guard will be immediately released if not held"]
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexGuard").field("data", &**self).finish()
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}
