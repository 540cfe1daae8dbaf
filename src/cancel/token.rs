//! A cloneable cancellation token with optional deadline.

use super::{Cancel, CancelReason, WakerKey};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::Waker;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct TokenInner {
    /// Set once `state.reason` is recorded; lets `reason()` skip the lock.
    fired: AtomicBool,
    deadline: Option<Instant>,
    state: Mutex<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    reason: Option<CancelReason>,
    wakers: Vec<(u64, Waker)>,
    next_key: u64,
    children: Vec<Weak<TokenInner>>,
}

impl TokenInner {
    fn new(deadline: Option<Instant>) -> Self {
        Self {
            fired: AtomicBool::new(false),
            deadline,
            state: Mutex::new(TokenState::default()),
        }
    }

    /// Records `requested` as the reason, unless the deadline already passed:
    /// a token that could have reported `DeadlineExceeded` keeps that reason.
    fn fire(&self, requested: CancelReason) {
        let reason = match self.deadline {
            Some(deadline) if Instant::now() >= deadline => CancelReason::DeadlineExceeded,
            _ => requested,
        };
        let (wakers, children) = {
            let mut state = self.state.lock();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason);
            self.fired.store(true, Ordering::Release);
            let wakers: SmallVec<[Waker; 4]> =
                state.wakers.drain(..).map(|(_, waker)| waker).collect();
            (wakers, std::mem::take(&mut state.children))
        };

        tracing::trace!(%reason, wakers = wakers.len(), "cancel token fired");

        for waker in wakers {
            waker.wake();
        }
        for child in children.iter().filter_map(Weak::upgrade) {
            child.fire(reason);
        }
    }

    fn reason(&self) -> Option<CancelReason> {
        if self.fired.load(Ordering::Acquire) {
            return self.state.lock().reason;
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }
}

/// A cancellation signal that fires on [`CancelToken::cancel`] or when its
/// deadline passes, whichever comes first.
///
/// Clones share state: cancelling one clone cancels all of them. Child tokens
/// created with [`CancelToken::child`] fire when their parent fires, but
/// cancelling a child leaves the parent untouched.
///
/// # Example
///
/// ```
/// use cxlock::{Cancel, CancelReason, CancelToken};
/// use std::time::Duration;
///
/// let token = CancelToken::with_timeout(Duration::from_secs(30));
/// assert!(!token.is_cancelled());
///
/// token.cancel();
/// assert_eq!(token.reason(), Some(CancelReason::Cancelled));
/// ```
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Creates a token without a deadline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner::new(None)),
        }
    }

    /// Creates a token that fires at `deadline`.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Arc::new(TokenInner::new(Some(deadline))),
        }
    }

    /// Creates a token that fires once `timeout` has elapsed from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Creates a child token sharing this token's deadline.
    #[must_use]
    pub fn child(&self) -> Self {
        self.derive(self.inner.deadline)
    }

    /// Creates a child token whose deadline is the earlier of this token's
    /// deadline and `timeout` from now.
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        let deadline = self.inner.deadline.map_or(own, |parent| parent.min(own));
        self.derive(Some(deadline))
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        let child = Arc::new(TokenInner::new(deadline));
        let inherited = {
            let mut state = self.inner.state.lock();
            if state.reason.is_none() {
                state.children.retain(|weak| weak.strong_count() > 0);
                state.children.push(Arc::downgrade(&child));
            }
            state.reason
        };
        if let Some(reason) = inherited {
            child.fire(reason);
        }
        Self { inner: child }
    }

    /// Fires the token, waking every blocked call racing against it.
    ///
    /// If the deadline already passed, the token records
    /// [`CancelReason::DeadlineExceeded`] instead so the reason a caller
    /// observed never changes. Cancelling twice is a no-op.
    pub fn cancel(&self) {
        self.inner.fire(CancelReason::Cancelled);
    }

    /// Returns the time left until the deadline, or `None` without one.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    #[cfg(test)]
    fn registered_wakers(&self) -> usize {
        self.inner.state.lock().wakers.len()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancel for CancelToken {
    #[inline]
    fn reason(&self) -> Option<CancelReason> {
        self.inner.reason()
    }

    #[inline]
    fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    fn register_waker(&self, waker: &Waker) -> WakerKey {
        let mut state = self.inner.state.lock();
        if state.reason.is_some() {
            drop(state);
            waker.wake_by_ref();
            return WakerKey::NONE;
        }
        let key = state.next_key;
        state.next_key += 1;
        state.wakers.push((key, waker.clone()));
        WakerKey::new(key)
    }

    fn unregister_waker(&self, key: WakerKey) {
        if key == WakerKey::NONE {
            return;
        }
        let mut state = self.inner.state.lock();
        state.wakers.retain(|(k, _)| *k != key.get());
    }
}
