//! Cancellation signals.
//!
//! Every blocking operation in this crate takes a caller-owned cancellation
//! signal and races its wait against it. The locks never create, fire or
//! retain a signal; they only observe it for the duration of one call.
//!
//! # The `Cancel` contract
//!
//! An implementor provides:
//!
//! - a non-blocking query telling whether (and why) it has fired,
//! - its deadline, if it has one, so waiters can park with a timeout instead
//!   of polling,
//! - waker registration, so an explicit cancel can unpark a blocked caller.
//!
//! Firing is monotonic: once [`Cancel::reason`] returns `Some`, it must keep
//! returning `Some` with the same reason.
//!
//! [`CancelToken`] is the crate's own implementation and covers both
//! explicit cancellation and deadlines. [`Never`] never fires.

mod token;

pub use token::CancelToken;

use crate::sync::parker::Parker;
use std::sync::Arc;
use std::task::Waker;
use std::time::Instant;

/// Why a cancellation signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The signal was cancelled explicitly.
    Cancelled,
    /// The signal's deadline passed.
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Handle identifying a waker registered with a [`Cancel`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakerKey(u64);

impl WakerKey {
    /// Key for signals that never wake anything.
    pub const NONE: Self = Self(u64::MAX);

    /// Wraps an implementation-defined key.
    #[must_use]
    pub const fn new(key: u64) -> Self {
        Self(key)
    }

    /// Returns the implementation-defined key.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// An externally owned cancellation signal.
///
/// See the [module documentation](self) for the contract.
pub trait Cancel {
    /// Returns the reason the signal fired, or `None` if it has not fired.
    ///
    /// This never blocks. Implementations with a deadline report
    /// [`CancelReason::DeadlineExceeded`] once it has passed, even if no one
    /// has observed the expiry before.
    fn reason(&self) -> Option<CancelReason>;

    /// Returns the instant at which the signal fires on its own, if any.
    fn deadline(&self) -> Option<Instant> {
        None
    }

    /// Registers `waker` to be woken when the signal is fired explicitly.
    ///
    /// Deadline expiry does not need to wake registered wakers; waiters park
    /// with a timeout derived from [`Cancel::deadline`].
    fn register_waker(&self, waker: &Waker) -> WakerKey;

    /// Removes a waker previously registered with [`Cancel::register_waker`].
    ///
    /// Unknown or already-fired keys are ignored.
    fn unregister_waker(&self, key: WakerKey);

    /// Returns true if the signal has fired.
    fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Returns `Err` with the reason if the signal has fired.
    ///
    /// # Errors
    ///
    /// Returns the [`CancelReason`] once the signal has fired.
    fn checkpoint(&self) -> Result<(), CancelReason> {
        self.reason().map_or(Ok(()), Err)
    }

    /// Blocks the calling thread until the signal fires.
    ///
    /// Blocks forever for a signal that never fires.
    fn wait(&self) -> CancelReason {
        if let Some(reason) = self.reason() {
            return reason;
        }

        let parker = Parker::new();
        let key = self.register_waker(&parker.waker());
        let reason = loop {
            if let Some(reason) = self.reason() {
                break reason;
            }
            parker.park_until(self.deadline());
        };
        self.unregister_waker(key);
        reason
    }
}

impl<C: Cancel + ?Sized> Cancel for &C {
    fn reason(&self) -> Option<CancelReason> {
        (**self).reason()
    }

    fn deadline(&self) -> Option<Instant> {
        (**self).deadline()
    }

    fn register_waker(&self, waker: &Waker) -> WakerKey {
        (**self).register_waker(waker)
    }

    fn unregister_waker(&self, key: WakerKey) {
        (**self).unregister_waker(key);
    }
}

impl<C: Cancel + ?Sized> Cancel for Arc<C> {
    fn reason(&self) -> Option<CancelReason> {
        (**self).reason()
    }

    fn deadline(&self) -> Option<Instant> {
        (**self).deadline()
    }

    fn register_waker(&self, waker: &Waker) -> WakerKey {
        (**self).register_waker(waker)
    }

    fn unregister_waker(&self, key: WakerKey) {
        (**self).unregister_waker(key);
    }
}

impl<C: Cancel + ?Sized> Cancel for Box<C> {
    fn reason(&self) -> Option<CancelReason> {
        (**self).reason()
    }

    fn deadline(&self) -> Option<Instant> {
        (**self).deadline()
    }

    fn register_waker(&self, waker: &Waker) -> WakerKey {
        (**self).register_waker(waker)
    }

    fn unregister_waker(&self, key: WakerKey) {
        (**self).unregister_waker(key);
    }
}

/// A signal that never fires.
///
/// Blocking calls made with `Never` behave like their non-cancellable
/// counterparts in `std`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Never;

impl Cancel for Never {
    #[inline]
    fn reason(&self) -> Option<CancelReason> {
        None
    }

    #[inline]
    fn register_waker(&self, _waker: &Waker) -> WakerKey {
        WakerKey::NONE
    }

    #[inline]
    fn unregister_waker(&self, _key: WakerKey) {}
}
