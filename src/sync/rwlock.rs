//! Cancellation-aware read/write lock.
//!
//! The lock admits one writer or any number of readers. Blocking calls race
//! a caller-supplied cancellation signal; a cancelled call never holds any
//! part of the lock.
//!
//! # State
//!
//! [`RawRwLock`] keeps a signed reader count under a short internal mutex:
//!
//! | `readers` | Meaning            |
//! |-----------|--------------------|
//! | `> 0`     | that many readers  |
//! | `0`       | unlocked           |
//! | `-1`      | one writer         |
//!
//! Exclusive ownership is represented by the `unlocked` [`Gate`] token. The
//! token is released into the gate only when `readers` returns to zero, and
//! every transition out of zero takes it first. Whoever takes the token is
//! the only caller allowed to move `readers` away from zero.
//!
//! # Reader conversion
//!
//! A reader arriving at a lock with no readers cannot just bump the count: a
//! writer may be mid-acquisition. It takes the token instead ("conversion"),
//! sets `readers = 1` and broadcasts *retry*. Every reader blocked behind the
//! same token wakes on that broadcast and re-enters the fast path instead of
//! queueing one by one for the hand-off.
//!
//! The retry broadcast is an epoch counter plus a list of wakers, both only
//! changed while the internal mutex is held. A reader captures the epoch
//! before it waits, so a broadcast meant for an earlier cohort never wakes a
//! late arrival.
//!
//! # Fairness
//!
//! None beyond the gate's FIFO hand-off. Readers keep entering while the lock
//! is read-held, so a blocked writer waits until the last reader leaves.
//!
//! # Example
//!
//! ```
//! use cxlock::{Never, RwLock};
//!
//! let lock = RwLock::new(vec![1, 2, 3]);
//!
//! let r1 = lock.read(&Never)?;
//! let r2 = lock.read(&Never)?;
//! assert_eq!(r1.len() + r2.len(), 6);
//! drop((r1, r2));
//!
//! lock.write(&Never)?.push(4);
//! # Ok::<(), cxlock::LockError>(())
//! ```

#![allow(unsafe_code)]

use parking_lot::Mutex as ParkingMutex;
use smallvec::SmallVec;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Waker;

use crate::cancel::Cancel;
use crate::error::{LockError, TryLockError};
use crate::sync::gate::{Gate, Wait, Waiter};
use crate::sync::parker::Parker;

#[derive(Debug, Default)]
struct State {
    /// Positive: reader count. Negative: write-locked. Zero: unlocked.
    readers: isize,
    /// Readers blocked in the slow path, woken by a retry broadcast.
    retry_waiters: Vec<Waiter>,
    next_waiter_id: u64,
}

/// A read/write lock without data whose acquisitions race a cancellation
/// signal.
///
/// Unlocking is explicit. `unlock`/`read_unlock` panic if the lock is not
/// held in the matching mode.
#[derive(Debug)]
pub struct RawRwLock {
    state: ParkingMutex<State>,
    /// Holds its token exactly while the lock is free and no hand-off is in
    /// flight.
    unlocked: Gate,
    /// Bumped by every retry broadcast, only while `state` is locked.
    retry_epoch: AtomicU64,
}

impl RawRwLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ParkingMutex::new(State::default()),
            unlocked: Gate::new(),
            retry_epoch: AtomicU64::new(0),
        }
    }

    /// Acquires exclusive access, blocking until granted or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Cancelled`] if the signal fired first; the lock
    /// is then not held by this caller.
    pub fn lock<C: Cancel + ?Sized>(&self, cancel: &C) -> Result<(), LockError> {
        cancel.checkpoint()?;

        if self.try_lock() {
            return Ok(());
        }

        // Exclusive acquisition does not care whether readers or a writer
        // hold the lock; it only waits for its turn at the token.
        tracing::trace!("rwlock writer waiting for hand-off");
        self.unlocked.acquire(cancel)?;

        let mut state = self.state.lock();
        claim(&mut state, -1);
        Ok(())
    }

    /// Acquires exclusive access if doing so would not block.
    pub fn try_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.readers == 0 && self.unlocked.try_acquire() {
            state.readers = -1;
            true
        } else {
            false
        }
    }

    /// Releases exclusive access, handing the lock to one blocked caller.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not write-locked.
    pub fn unlock(&self) {
        let mut state = self.state.lock();
        if state.readers >= 0 {
            drop(state);
            tracing::error!("unlock of an rwlock that is not write-locked");
            panic!("rwlock is not write-locked");
        }
        state.readers = 0;
        self.unlocked.release();
    }

    /// Acquires shared access, blocking until granted or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Cancelled`] if the signal fired first; the lock
    /// is then not held by this caller.
    pub fn read<C: Cancel + ?Sized>(&self, cancel: &C) -> Result<(), LockError> {
        cancel.checkpoint()?;
        if self.try_read() {
            return Ok(());
        }

        let parker = Parker::new();
        loop {
            cancel.checkpoint()?;

            let (epoch, retry_id) = {
                let mut state = self.state.lock();
                if self.try_read_locked(&mut state) {
                    return Ok(());
                }

                // Write-held, or free with a hand-off in flight: wait for the
                // token, but register for retry first so a conversion by
                // another reader wakes us.
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.retry_waiters.push(Waiter {
                    waker: parker.waker(),
                    id,
                });
                (self.retry_epoch.load(Ordering::Acquire), id)
            };

            let outcome = self.unlocked.acquire_with(cancel, &parker, || {
                self.retry_epoch.load(Ordering::Acquire) != epoch
            });

            let wakers = {
                let mut state = self.state.lock();
                state.retry_waiters.retain(|w| w.id != retry_id);
                match outcome {
                    Wait::Acquired => {
                        claim(&mut state, 1);
                        self.broadcast_retry(&mut state)
                    }
                    Wait::Interrupted => {
                        drop(state);
                        tracing::trace!(epoch, "rwlock reader retrying admission");
                        continue;
                    }
                    Wait::Cancelled(reason) => return Err(LockError::Cancelled(reason)),
                }
            };
            wake_all(wakers);
            return Ok(());
        }
    }

    /// Acquires shared access if doing so would not block.
    pub fn try_read(&self) -> bool {
        let mut state = self.state.lock();
        self.try_read_locked(&mut state)
    }

    /// Releases shared access; the last reader out hands the lock on.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not read-locked.
    pub fn read_unlock(&self) {
        let mut state = self.state.lock();
        if state.readers <= 0 {
            drop(state);
            tracing::error!("read_unlock of an rwlock that is not read-locked");
            panic!("rwlock is not read-locked");
        }
        state.readers -= 1;
        if state.readers == 0 {
            self.unlocked.release();
        }
    }

    /// Returns true if the lock is held in either mode.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.lock().readers != 0
    }

    /// Returns true if a writer holds the lock.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().readers < 0
    }

    /// Returns the number of readers holding the lock.
    #[must_use]
    pub fn readers(&self) -> usize {
        usize::try_from(self.state.lock().readers).unwrap_or(0)
    }

    /// Returns the number of callers blocked waiting for the lock.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.unlocked.waiters()
    }

    /// Read fast path and non-blocking conversion, under the internal lock.
    ///
    /// Wakers collected by a conversion broadcast are woken before return;
    /// waking only unparks, it never touches `state`.
    fn try_read_locked(&self, state: &mut State) -> bool {
        if state.readers > 0 {
            state.readers += 1;
            return true;
        }
        if state.readers == 0 && self.unlocked.try_acquire() {
            state.readers = 1;
            wake_all(self.broadcast_retry(state));
            return true;
        }
        false
    }

    /// Tells every reader blocked on the current epoch to retry.
    fn broadcast_retry(&self, state: &mut State) -> SmallVec<[Waker; 4]> {
        let epoch = self.retry_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let wakers: SmallVec<[Waker; 4]> = state.retry_waiters.drain(..).map(|w| w.waker).collect();
        tracing::trace!(epoch, woken = wakers.len(), "rwlock retry broadcast");
        wakers
    }

    #[cfg(test)]
    fn retry_waiters(&self) -> usize {
        self.state.lock().retry_waiters.len()
    }

}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Moves `readers` away from zero after a blocking wait handed us the token.
fn claim(state: &mut State, readers: isize) {
    if state.readers != 0 {
        tracing::error!(
            found = state.readers,
            "rwlock token holder found the lock already held"
        );
        debug_assert_eq!(state.readers, 0, "token holder found non-zero readers");
    }
    state.readers = readers;
}

fn wake_all(wakers: SmallVec<[Waker; 4]>) {
    for waker in wakers {
        waker.wake();
    }
}

/// A cancellation-aware read/write lock protecting a value.
pub struct RwLock<T> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

// Safety: readers share `&T`, the writer gets `&mut T`; `raw` keeps them apart.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new lock containing the given value.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            raw: RawRwLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires a read guard, blocking until granted or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Cancelled`] if the signal fired first.
    pub fn read<C: Cancel + ?Sized>(&self, cancel: &C) -> Result<RwLockReadGuard<'_, T>, LockError> {
        self.raw.read(cancel)?;
        Ok(RwLockReadGuard { lock: self })
    }

    /// Tries to acquire a read guard without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TryLockError::Locked`] if a writer holds the lock.
    pub fn try_read(&self) -> Result<RwLockReadGuard<'_, T>, TryLockError> {
        if self.raw.try_read() {
            Ok(RwLockReadGuard { lock: self })
        } else {
            Err(TryLockError::Locked)
        }
    }

    /// Acquires a write guard, blocking until granted or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Cancelled`] if the signal fired first.
    pub fn write<C: Cancel + ?Sized>(&self, cancel: &C) -> Result<RwLockWriteGuard<'_, T>, LockError> {
        self.raw.lock(cancel)?;
        Ok(RwLockWriteGuard { lock: self })
    }

    /// Tries to acquire a write guard without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TryLockError::Locked`] if the lock is held in any mode.
    pub fn try_write(&self) -> Result<RwLockWriteGuard<'_, T>, TryLockError> {
        if self.raw.try_lock() {
            Ok(RwLockWriteGuard { lock: self })
        } else {
            Err(TryLockError::Locked)
        }
    }

    /// Returns true if the lock is held in either mode.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Returns the number of readers holding the lock.
    #[must_use]
    pub fn readers(&self) -> usize {
        self.raw.readers()
    }

    /// Returns a mutable reference to the inner value.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the lock and returns the inner value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("RwLock");
        match self.try_read() {
            Ok(guard) => d.field("data", &&*guard),
            Err(_) => d.field("data", &format_args!("<locked>")),
        };
        d.finish_non_exhaustive()
    }
}

/// Guard for shared access; releases on drop.
#[must_use = "guard will be immediately released if not held"]
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: a read guard excludes writers.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLockReadGuard").field("data", &**self).finish()
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.read_unlock();
    }
}

/// Guard for exclusive access; releases on drop.
#[must_use = "guard will be immediately released if not held"]
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

unsafe impl<T: Sync> Sync for RwLockWriteGuard<'_, T> {}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: a write guard is exclusive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: a write guard is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLockWriteGuard").field("data", &**self).finish()
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}
