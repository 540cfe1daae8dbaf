//! Error types.
//!
//! Errors fall into two disjoint classes:
//!
//! - **Cancellation** is an expected outcome of any blocking call whose signal
//!   fires first. It is returned as a value and the call can be retried.
//! - **Misuse** (unlocking a lock that is not held in that mode) is a
//!   programming error. It is reported by panicking and never appears here.
//!
//! [`OnceError`] additionally carries the caller's own action error.

use crate::cancel::CancelReason;

/// Error returned when a blocking lock acquisition fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockError {
    /// The cancellation signal fired before the lock was acquired.
    Cancelled(CancelReason),
}

impl LockError {
    /// Returns why the acquisition was cancelled.
    #[must_use]
    pub const fn reason(self) -> CancelReason {
        match self {
            Self::Cancelled(reason) => reason,
        }
    }
}

impl From<CancelReason> for LockError {
    fn from(reason: CancelReason) -> Self {
        Self::Cancelled(reason)
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled(reason) => write!(f, "lock acquisition {reason}"),
        }
    }
}

impl std::error::Error for LockError {}

/// Error returned when a lock cannot be acquired without blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TryLockError {
    /// The lock is held in a conflicting mode.
    Locked,
}

impl std::fmt::Display for TryLockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked => write!(f, "lock is held"),
        }
    }
}

impl std::error::Error for TryLockError {}

/// Error returned by [`Once::call`](crate::sync::Once::call) and
/// [`OnceCell::get_or_try_init`](crate::sync::OnceCell::get_or_try_init).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OnceError<E> {
    /// The signal fired while waiting for a concurrent call to finish.
    #[error("once call {0}")]
    Cancelled(CancelReason),
    /// The action ran and failed; a later call will run it again.
    #[error("once action failed")]
    Failed(#[source] E),
}

impl<E> OnceError<E> {
    /// Returns true if the call was cancelled before running the action.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns the action's error, if the action ran and failed.
    #[must_use]
    pub fn into_failed(self) -> Option<E> {
        match self {
            Self::Failed(err) => Some(err),
            Self::Cancelled(_) => None,
        }
    }
}

impl<E> From<LockError> for OnceError<E> {
    fn from(err: LockError) -> Self {
        Self::Cancelled(err.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn lock_error_debug_clone_copy_eq_display() {
        let err = LockError::Cancelled(CancelReason::DeadlineExceeded);
        let copied = err;
        assert_eq!(err, copied);
        assert_eq!(err.reason(), CancelReason::DeadlineExceeded);
        assert_eq!(err.to_string(), "lock acquisition deadline exceeded");
        assert!(format!("{err:?}").contains("DeadlineExceeded"));
    }

    #[test]
    fn try_lock_error_display() {
        assert_eq!(TryLockError::Locked.to_string(), "lock is held");
    }

    #[test]
    fn once_error_exposes_source() {
        let err: OnceError<Boom> = OnceError::Failed(Boom);
        assert_eq!(err.to_string(), "once action failed");
        assert_eq!(err.source().map(ToString::to_string), Some("boom".into()));
        assert!(!err.is_cancelled());
        assert!(err.into_failed().is_some());
    }

    #[test]
    fn once_error_from_lock_error() {
        let err: OnceError<Boom> = LockError::Cancelled(CancelReason::Cancelled).into();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "once call cancelled");
        assert!(err.source().is_none());
    }
}
