//! Cancellable single-slot token gate.
//!
//! A [`Gate`] holds at most one token. Acquiring takes the token, blocking
//! until one is available or the caller's cancellation signal fires.
//! Releasing puts the token back and hands it to the oldest waiter.
//!
//! # Hand-off
//!
//! `release` pops the head of the waiter queue and wakes it. The token is not
//! reserved for that waiter: a concurrent `try_acquire` may take it first, in
//! which case the woken waiter re-enqueues at the *front* to keep its place.
//! A waiter that leaves (cancelled or interrupted) while the token is free
//! dequeues and wakes the next waiter, so a hand-off is never lost even when
//! several waiters in a row give up.

use crate::cancel::{Cancel, CancelReason};
use crate::sync::parker::Parker;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::task::Waker;

#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) waker: Waker,
    pub(crate) id: u64,
}

#[derive(Debug)]
struct GateState {
    /// Whether the token is in the slot.
    available: bool,
    /// Queue of blocked acquirers.
    waiters: VecDeque<Waiter>,
    /// Monotonic counter for waiter identity.
    next_waiter_id: u64,
}

impl GateState {
    fn enqueue(&mut self, waker: &Waker, front: bool) -> u64 {
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        let waiter = Waiter {
            waker: waker.clone(),
            id,
        };
        if front {
            self.waiters.push_front(waiter);
        } else {
            self.waiters.push_back(waiter);
        }
        id
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.id != id);
        before != self.waiters.len()
    }
}

/// Outcome of [`Gate::acquire_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    /// The token was taken.
    Acquired,
    /// The caller's interrupt predicate became true first.
    Interrupted,
    /// The cancellation signal fired first.
    Cancelled(CancelReason),
}

/// A binary semaphore whose acquire races a cancellation signal.
#[derive(Debug)]
pub struct Gate {
    state: Mutex<GateState>,
}

impl Gate {
    /// Creates a gate holding its token.
    #[must_use]
    pub fn new() -> Self {
        Self::with_token(true)
    }

    /// Creates a gate without a token.
    #[must_use]
    pub fn empty() -> Self {
        Self::with_token(false)
    }

    fn with_token(available: bool) -> Self {
        Self {
            state: Mutex::new(GateState {
                available,
                waiters: VecDeque::with_capacity(4),
                next_waiter_id: 0,
            }),
        }
    }

    /// Returns true if the token is in the slot.
    #[inline]
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state.lock().available
    }

    /// Returns the number of threads blocked in [`Gate::acquire`].
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Takes the token if it is available. Never blocks.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.available {
            state.available = false;
            true
        } else {
            false
        }
    }

    /// Takes the token, blocking until it is available or `cancel` fires.
    ///
    /// A signal that has already fired wins over an available token.
    ///
    /// # Errors
    ///
    /// Returns the signal's [`CancelReason`] if it fired before the token was
    /// taken. The gate is left exactly as if this call never happened.
    pub fn acquire<C: Cancel + ?Sized>(&self, cancel: &C) -> Result<(), CancelReason> {
        cancel.checkpoint()?;

        if self.try_acquire() {
            return Ok(());
        }

        let parker = Parker::new();
        match self.acquire_with(cancel, &parker, || false) {
            Wait::Acquired => Ok(()),
            Wait::Cancelled(reason) => Err(reason),
            Wait::Interrupted => unreachable!("gate acquire has no interrupt source"),
        }
    }

    /// Puts the token back and wakes the oldest waiter.
    ///
    /// # Panics
    ///
    /// Panics if the gate already holds its token.
    pub fn release(&self) {
        if !self.try_release() {
            tracing::error!("release of a gate that is not held");
            panic!("gate is not held");
        }
    }

    /// Puts the token back; returns false, changing nothing, if the slot is
    /// already full.
    pub(crate) fn try_release(&self) -> bool {
        let waker = {
            let mut state = self.state.lock();
            if state.available {
                return false;
            }
            state.available = true;
            state.waiters.pop_front().map(|w| w.waker)
        };
        if let Some(waker) = waker {
            tracing::trace!("gate hand-off to queued waiter");
            waker.wake();
        }
        true
    }

    /// Blocks until the token is taken, `interrupted` returns true, or
    /// `cancel` fires.
    ///
    /// The token is checked first on every wake-up, so a hand-off that is
    /// already complete is never reported as cancelled or interrupted.
    /// `interrupted` is called without the gate's internal lock held; any
    /// event that can make it true must wake `parker`.
    pub(crate) fn acquire_with<C, F>(&self, cancel: &C, parker: &Parker, mut interrupted: F) -> Wait
    where
        C: Cancel + ?Sized,
        F: FnMut() -> bool,
    {
        let waker = parker.waker();
        let key = cancel.register_waker(&waker);
        let mut slot = QueueSlot {
            gate: self,
            id: None,
        };

        let outcome = loop {
            {
                let mut state = self.state.lock();
                if state.available {
                    state.available = false;
                    if let Some(id) = slot.id.take() {
                        state.remove(id);
                    }
                    break Wait::Acquired;
                }

                match slot.id {
                    Some(id) if state.waiters.iter().any(|w| w.id == id) => {}
                    Some(_) => {
                        // Dequeued by a release whose token was stolen;
                        // keep our place at the head.
                        slot.id = Some(state.enqueue(&waker, true));
                    }
                    None => slot.id = Some(state.enqueue(&waker, false)),
                }
            }

            if interrupted() {
                break Wait::Interrupted;
            }
            if let Some(reason) = cancel.reason() {
                break Wait::Cancelled(reason);
            }

            tracing::trace!("gate waiter parking");
            parker.park_until(cancel.deadline());
        };

        drop(slot);
        cancel.unregister_waker(key);
        if let Wait::Cancelled(reason) = outcome {
            tracing::trace!(%reason, "gate acquire cancelled");
        }
        outcome
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Leaves the waiter queue when a blocked acquire gives up.
struct QueueSlot<'a> {
    gate: &'a Gate,
    id: Option<u64>,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let Some(id) = self.id else {
            return;
        };

        let next = {
            let mut state = self.gate.state.lock();
            state.remove(id);
            if state.available {
                // The token is free and we are not taking it: hand it to the
                // next waiter exactly as `release` would, so that waiter in
                // turn passes it on if it is leaving too.
                state.waiters.pop_front().map(|w| w.waker)
            } else {
                None
            }
        };
        if let Some(waker) = next {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelToken, Never};
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn init_test(test_name: &str) {
        init_test_logging();
        crate::test_phase!(test_name);
    }

    fn wait_for_waiters(gate: &Gate, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while gate.waiters() < count {
            assert!(Instant::now() < deadline, "waiters never queued");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn new_gate_holds_token() {
        init_test("new_gate_holds_token");
        let gate = Gate::new();
        crate::assert_with_log!(gate.is_available(), "token present", true, gate.is_available());
        let first = gate.try_acquire();
        let second = gate.try_acquire();
        crate::assert_with_log!(first, "first try succeeds", true, first);
        crate::assert_with_log!(!second, "second try fails", false, second);
        crate::test_complete!("new_gate_holds_token");
    }

    #[test]
    fn empty_gate_blocks_until_release() {
        init_test("empty_gate_blocks_until_release");
        let gate = Arc::new(Gate::empty());
        let acquired = Arc::new(AtomicBool::new(false));

        let handle = {
            let gate = Arc::clone(&gate);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                gate.acquire(&Never).expect("never cancelled");
                acquired.store(true, Ordering::SeqCst);
            })
        };

        wait_for_waiters(&gate, 1);
        let early = acquired.load(Ordering::SeqCst);
        crate::assert_with_log!(!early, "still blocked", false, early);

        gate.release();
        handle.join().expect("acquirer panicked");
        let done = acquired.load(Ordering::SeqCst);
        crate::assert_with_log!(done, "acquired after release", true, done);
        crate::test_complete!("empty_gate_blocks_until_release");
    }

    #[test]
    fn fired_signal_wins_over_available_token() {
        init_test("fired_signal_wins_over_available_token");
        let gate = Gate::new();
        let token = CancelToken::new();
        token.cancel();

        let result = gate.acquire(&token);
        crate::assert_with_log!(
            result == Err(CancelReason::Cancelled),
            "cancelled",
            Err::<(), _>(CancelReason::Cancelled),
            result
        );
        crate::assert_with_log!(gate.is_available(), "token untouched", true, gate.is_available());
        crate::test_complete!("fired_signal_wins_over_available_token");
    }

    #[test]
    fn acquire_times_out_and_leaves_queue() {
        init_test("acquire_times_out_and_leaves_queue");
        let gate = Gate::empty();
        let token = CancelToken::with_timeout(Duration::from_millis(20));

        let result = gate.acquire(&token);
        crate::assert_with_log!(
            result == Err(CancelReason::DeadlineExceeded),
            "deadline exceeded",
            Err::<(), _>(CancelReason::DeadlineExceeded),
            result
        );
        crate::assert_with_log!(gate.waiters() == 0, "queue empty", 0, gate.waiters());
        crate::test_complete!("acquire_times_out_and_leaves_queue");
    }

    #[test]
    fn explicit_cancel_wakes_blocked_acquire() {
        init_test("explicit_cancel_wakes_blocked_acquire");
        let gate = Arc::new(Gate::empty());
        let token = CancelToken::new();

        let handle = {
            let gate = Arc::clone(&gate);
            let token = token.clone();
            thread::spawn(move || gate.acquire(&token))
        };

        wait_for_waiters(&gate, 1);
        token.cancel();

        let result = handle.join().expect("acquirer panicked");
        crate::assert_with_log!(
            result == Err(CancelReason::Cancelled),
            "cancelled",
            Err::<(), _>(CancelReason::Cancelled),
            result
        );
        crate::assert_with_log!(!gate.is_available(), "no token appeared", false, gate.is_available());
        crate::test_complete!("explicit_cancel_wakes_blocked_acquire");
    }

    #[test]
    fn interrupted_waiter_after_handoff_wakes_next() {
        init_test("interrupted_waiter_after_handoff_wakes_next");
        let gate = Arc::new(Gate::empty());
        let blocked = Arc::new(AtomicBool::new(true));

        // Waiter B queues first and blocks normally.
        let b = {
            let gate = Arc::clone(&gate);
            let blocked = Arc::clone(&blocked);
            thread::spawn(move || {
                gate.acquire(&Never).expect("never cancelled");
                blocked.store(false, Ordering::SeqCst);
            })
        };
        wait_for_waiters(&gate, 1);

        // Waiter A is at the back; steal the head slot so that A is woken by
        // the release, then have A leave via interrupt without taking the
        // token. B must still get it.
        let slot = QueueSlot {
            gate: &gate,
            id: Some(gate.state.lock().enqueue(&Parker::new().waker(), true)),
        };
        {
            let mut state = gate.state.lock();
            state.available = true;
            let head = state.waiters.pop_front().expect("head waiter");
            assert_eq!(Some(head.id), slot.id);
        }
        drop(slot);

        b.join().expect("waiter B panicked");
        let unblocked = !blocked.load(Ordering::SeqCst);
        crate::assert_with_log!(unblocked, "baton reached B", true, unblocked);
        crate::test_complete!("interrupted_waiter_after_handoff_wakes_next");
    }

    #[test]
    fn consecutive_leavers_pass_handoff_to_blocked_waiter() {
        init_test("consecutive_leavers_pass_handoff_to_blocked_waiter");
        let gate = Arc::new(Gate::empty());

        // Two leaving waiters at the head, queued before the blocked one.
        let first = Parker::new();
        let second = Parker::new();
        let (first_id, second_id) = {
            let mut state = gate.state.lock();
            (
                state.enqueue(&first.waker(), false),
                state.enqueue(&second.waker(), false),
            )
        };

        let blocked = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.acquire(&Never))
        };
        wait_for_waiters(&gate, 3);

        // Release dequeues the first waiter; both leaders then give up
        // without taking the token.
        gate.release();
        drop(QueueSlot {
            gate: &gate,
            id: Some(first_id),
        });
        drop(QueueSlot {
            gate: &gate,
            id: Some(second_id),
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while !blocked.is_finished() {
            assert!(
                Instant::now() < deadline,
                "blocked waiter never woken although the token is free"
            );
            thread::sleep(Duration::from_millis(1));
        }
        let result = blocked.join().expect("blocked waiter panicked");
        crate::assert_with_log!(result.is_ok(), "hand-off reached third waiter", true, result);
        crate::assert_with_log!(!gate.is_available(), "token taken", false, gate.is_available());
        crate::assert_with_log!(gate.waiters() == 0, "queue empty", 0, gate.waiters());
        crate::test_complete!("consecutive_leavers_pass_handoff_to_blocked_waiter");
    }

    #[test]
    fn release_of_full_gate_panics() {
        init_test("release_of_full_gate_panics");
        let gate = Gate::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| gate.release()));
        crate::assert_with_log!(result.is_err(), "release panics", true, result.is_err());
        crate::assert_with_log!(gate.is_available(), "state unchanged", true, gate.is_available());
        crate::test_complete!("release_of_full_gate_panics");
    }

    #[test]
    fn try_release_reports_misuse_without_change() {
        init_test("try_release_reports_misuse_without_change");
        let gate = Gate::new();
        let released = gate.try_release();
        crate::assert_with_log!(!released, "slot already full", false, released);
        crate::test_complete!("try_release_reports_misuse_without_change");
    }

    #[test]
    fn exactly_one_of_two_waiters_gets_single_release() {
        init_test("exactly_one_of_two_waiters_gets_single_release");
        let gate = Arc::new(Gate::empty());

        let spawn = |gate: Arc<Gate>| {
            thread::spawn(move || {
                let token = CancelToken::with_timeout(Duration::from_millis(200));
                gate.acquire(&token)
            })
        };
        let a = spawn(Arc::clone(&gate));
        let b = spawn(Arc::clone(&gate));
        wait_for_waiters(&gate, 2);

        gate.release();

        let results = [
            a.join().expect("a panicked"),
            b.join().expect("b panicked"),
        ];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let timed_out = results
            .iter()
            .filter(|r| **r == Err(CancelReason::DeadlineExceeded))
            .count();
        crate::assert_with_log!(ok == 1, "one winner", 1, ok);
        crate::assert_with_log!(timed_out == 1, "one timeout", 1, timed_out);
        crate::test_complete!("exactly_one_of_two_waiters_gets_single_release");
    }
}
