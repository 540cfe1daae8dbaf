//! Locks whose blocking calls race a caller-supplied cancellation signal.
//!
//! `cxlock` provides a mutex, a read/write lock and a run-once primitive for
//! plain OS threads. Each blocking acquisition takes a [`Cancel`]
//! implementation, typically a [`CancelToken`] with a deadline, and returns
//! as soon as either the lock is granted or the signal fires:
//!
//! ```
//! use cxlock::{CancelReason, CancelToken, LockError, Mutex};
//! use std::time::Duration;
//!
//! let mutex = Mutex::new(0);
//! let held = mutex.lock(&CancelToken::new())?;
//!
//! let short = CancelToken::with_timeout(Duration::from_millis(10));
//! let err = mutex.lock(&short).unwrap_err();
//! assert_eq!(err, LockError::Cancelled(CancelReason::DeadlineExceeded));
//!
//! drop(held);
//! # Ok::<(), LockError>(())
//! ```
//!
//! # Modules
//!
//! - [`cancel`]: the [`Cancel`] contract, [`CancelToken`] and [`Never`]
//! - [`sync`]: [`Gate`], [`Mutex`], [`RwLock`], [`Once`] and friends
//! - [`error`]: [`LockError`], [`TryLockError`], [`OnceError`]
//!
//! # Logging
//!
//! The crate emits `tracing` events on slow paths and before misuse panics.
//! It never installs a subscriber.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod cancel;
pub mod error;
pub mod sync;

#[cfg(test)]
mod test_utils;

pub use cancel::{Cancel, CancelReason, CancelToken, Never, WakerKey};
pub use error::{LockError, OnceError, TryLockError};
pub use sync::{
    Gate, Mutex, MutexGuard, Once, OnceCell, RawMutex, RawRwLock, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
