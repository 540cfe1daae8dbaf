//! Cancellation-aware synchronization primitives.
//!
//! Every blocking call takes a cancellation signal by reference and races
//! it against the resource becoming available. Whichever comes first wins:
//!
//! - Resource first: the call returns holding it.
//! - Signal first: the call returns [`LockError::Cancelled`] and holds
//!   nothing. The call can simply be retried with a fresh signal.
//!
//! Releasing a primitive that is not held is a bug in the caller and panics.
//!
//! # Primitives
//!
//! - [`Gate`]: binary semaphore with FIFO hand-off, the building block below
//! - [`RawMutex`] / [`Mutex`]: mutual exclusion
//! - [`RawRwLock`] / [`RwLock`]: many readers or one writer
//! - [`Once`] / [`OnceCell`]: run a fallible action to success exactly once
//!
//! [`LockError::Cancelled`]: crate::LockError::Cancelled

pub(crate) mod gate;
mod mutex;
mod once;
pub(crate) mod parker;
mod rwlock;

pub use gate::Gate;
pub use mutex::{Mutex, MutexGuard, RawMutex};
pub use once::{Once, OnceCell};
pub use rwlock::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
