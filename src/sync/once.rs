//! Run an action to successful completion exactly once.
//!
//! [`Once`] differs from [`std::sync::Once`] in two ways: the action may
//! fail, in which case a later call runs it again, and a call that has to
//! wait for a concurrent call races the caller's cancellation signal.
//!
//! # Example
//!
//! ```
//! use cxlock::{Never, Once, OnceError};
//!
//! let once = Once::new();
//! let first: Result<(), OnceError<&str>> = once.call(&Never, |_| Err("not yet"));
//! assert!(first.is_err());
//!
//! once.call(&Never, |_| Ok::<(), &str>(()))?;
//! assert!(once.is_completed());
//! # Ok::<(), OnceError<&str>>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use crate::cancel::Cancel;
use crate::error::OnceError;
use crate::sync::mutex::RawMutex;

/// Unlocks a `RawMutex` when dropped, including during unwinding.
struct Unlock<'a>(&'a RawMutex);

impl Drop for Unlock<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// Runs an action until it first succeeds.
#[derive(Debug, Default)]
pub struct Once {
    done: AtomicBool,
    lock: RawMutex,
}

impl Once {
    /// Creates a `Once` whose action has not run.
    #[must_use]
    pub fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            lock: RawMutex::new(),
        }
    }

    /// Returns true once an action has completed successfully.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Runs `action` unless a previous call already completed successfully.
    ///
    /// Concurrent callers are serialized; one that waits for another observes
    /// its effects. The action receives the caller's signal so it can make
    /// its own blocking calls under the same budget.
    ///
    /// # Errors
    ///
    /// - [`OnceError::Cancelled`] if `cancel` fired while waiting for a
    ///   concurrent call. The action did not run.
    /// - [`OnceError::Failed`] with the action's own error. The `Once` stays
    ///   incomplete and the next call runs its action.
    ///
    /// If the action panics the `Once` stays incomplete and its lock is
    /// released.
    pub fn call<C, E, F>(&self, cancel: &C, action: F) -> Result<(), OnceError<E>>
    where
        C: Cancel + ?Sized,
        F: FnOnce(&C) -> Result<(), E>,
    {
        if self.is_completed() {
            return Ok(());
        }
        self.call_slow(cancel, action)
    }

    #[cold]
    fn call_slow<C, E, F>(&self, cancel: &C, action: F) -> Result<(), OnceError<E>>
    where
        C: Cancel + ?Sized,
        F: FnOnce(&C) -> Result<(), E>,
    {
        self.lock.lock(cancel)?;
        let _unlock = Unlock(&self.lock);

        if self.done.load(Ordering::Relaxed) {
            return Ok(());
        }

        match action(cancel) {
            Ok(()) => {
                self.done.store(true, Ordering::Release);
                tracing::debug!("once action completed");
                Ok(())
            }
            Err(err) => {
                tracing::debug!("once action failed; next call retries");
                Err(OnceError::Failed(err))
            }
        }
    }
}

/// A cell written at most once, by the first initializer that succeeds.
pub struct OnceCell<T> {
    value: OnceLock<T>,
    lock: RawMutex,
}

impl<T> OnceCell<T> {
    /// Creates an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            value: OnceLock::new(),
            lock: RawMutex::new(),
        }
    }

    /// Returns the value, if initialized. Never blocks.
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        self.value.get()
    }

    /// Returns true if the cell holds a value.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.value.get().is_some()
    }

    /// Returns the value, running `init` to produce it if the cell is empty.
    ///
    /// # Errors
    ///
    /// Same as [`Once::call`]: `Cancelled` if the signal fired while waiting
    /// for a concurrent initializer, `Failed` with `init`'s error otherwise.
    /// A failed `init` leaves the cell empty.
    pub fn get_or_try_init<C, E, F>(&self, cancel: &C, init: F) -> Result<&T, OnceError<E>>
    where
        C: Cancel + ?Sized,
        F: FnOnce(&C) -> Result<T, E>,
    {
        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        self.lock.lock(cancel)?;
        let _unlock = Unlock(&self.lock);

        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        let value = init(cancel).map_err(OnceError::Failed)?;
        tracing::debug!("once cell initialized");
        Ok(self.value.get_or_init(|| value))
    }

    /// Consumes the cell, returning its value if initialized.
    pub fn into_inner(self) -> Option<T> {
        self.value.into_inner()
    }
}

impl<T> Default for OnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for OnceCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnceCell")
            .field("value", &self.value.get())
            .finish_non_exhaustive()
    }
}
