//! Binary synchronization event.
use crate::klock::{self, CpuLockCell, CpuLockTokenRefMut};
use crate::service;
use crate::sync::wait::{SyncObject, WaitObject, WaitQueue};
use crate::utils::Init;
use crate::{Timeout, NO_WAIT, WAIT_INFINITE};

/// Binary event (signaled / non-signaled).
///
/// Supports two operation modes:
///
/// * auto-reset (default): [`Event::set`] wakes one waiting task and the
///   event resets automatically, and
/// * manual-reset: `set` wakes all waiting tasks and the state remains
///   signaled until [`Event::reset`].
///
/// [`Event::pulse`] follows Win32 `PulseEvent` semantics: release waiters
/// (one or all, per the mode), then force the state back to non-signaled
/// whether or not anyone was waiting. Pulse semantics are inherently racy
/// and considered unreliable in many usage scenarios; prefer explicit
/// `set` + `reset` patterns when possible.
///
/// Only usable when the kernel runs with `SYNC` mode enabled.
pub struct Event {
    manual_reset: bool,
    signaled: CpuLockCell<bool>,
    wait_queue: WaitQueue,
}

impl SyncObject for Event {
    fn wait_queue(&self) -> &WaitQueue {
        &self.wait_queue
    }

    fn on_waiter_removed(&self, mut lock: CpuLockTokenRefMut<'_>, waiter: &WaitObject) {
        // if the removed waiter did not time out, it consumed a wake from
        // `set` or `pulse`; auto-reset the event on its behalf
        if !self.manual_reset && self.signaled.get(&*lock) && !waiter.is_timeout() {
            self.signaled.replace(&mut *lock, false);
        }
    }
}

impl Event {
    /// An auto-reset event, initially non-signaled.
    pub const fn new() -> Self {
        Self::with_state(false, false)
    }

    /// `manual_reset` selects the mode; `initial_state` is `true` for an
    /// initially signaled event.
    pub const fn with_state(manual_reset: bool, initial_state: bool) -> Self {
        Self {
            manual_reset,
            signaled: CpuLockCell::new(initial_state),
            wait_queue: WaitQueue::INIT,
        }
    }

    /// Set the event to the signaled state.
    ///
    /// In auto-reset mode wakes one waiting task (if any), which resets
    /// the event again; in manual-reset mode wakes all waiting tasks and
    /// the state remains set. ISR-safe.
    ///
    /// Returns `false` when the event was already signaled (no-op).
    pub fn set(&self) -> bool {
        let mut lock = klock::lock_cpu();

        if self.signaled.get(&*lock) {
            return false;
        }
        self.signaled.replace(&mut *lock, true);

        if self.manual_reset {
            service::instance().wake_all(&mut lock, self);
        } else {
            // the kernel auto-resets the state in `on_waiter_removed`
            service::instance().wake_one(&mut lock, self);
        }

        true
    }

    /// Reset the event to the non-signaled state. ISR-safe.
    ///
    /// Returns whether the event was signaled before the call.
    pub fn reset(&self) -> bool {
        let mut lock = klock::lock_cpu();
        self.signaled.replace(&mut *lock, false)
    }

    /// Pulse the event: release waiters, then force non-signaled
    /// regardless of whether anyone was waiting. ISR-safe.
    pub fn pulse(&self) {
        let mut lock = klock::lock_cpu();

        // transition to signaled to be able to wake the waiting tasks
        self.signaled.replace(&mut *lock, true);

        if !self.wait_queue.is_empty() {
            if self.manual_reset {
                service::instance().wake_all(&mut lock, self);
            } else {
                service::instance().wake_one(&mut lock, self);
            }
        }

        self.signaled.replace(&mut *lock, false);
    }

    /// Wait until the event becomes signaled or `timeout` expires.
    ///
    /// ISR-unsafe, except with `NO_WAIT` (which never blocks). Returns
    /// `false` on timeout.
    pub fn wait(&self, timeout: Timeout) -> bool {
        let mut lock = klock::lock_cpu();

        // fast path: already signaled
        if self.signaled.get(&*lock) {
            if !self.manual_reset {
                self.signaled.replace(&mut *lock, false);
            }
            return true;
        }

        if timeout == NO_WAIT {
            return false;
        }

        // not supported inside an ISR beyond this point, may block
        debug_assert!(!klock::is_interrupt_context());

        let (_lock, outcome) = service::instance().start_waiting(lock, self, None, timeout);
        !outcome.timed_out
    }

    /// [`Event::wait`] with an infinite timeout.
    pub fn wait_infinite(&self) -> bool {
        self.wait(WAIT_INFINITE)
    }

    /// Poll the event without blocking: consume the signaled state (if
    /// auto-reset) and return whether it was signaled. ISR-safe.
    pub fn try_wait(&self) -> bool {
        let mut lock = klock::lock_cpu();

        if self.signaled.get(&*lock) {
            if !self.manual_reset {
                self.signaled.replace(&mut *lock, false);
            }
            return true;
        }

        false
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
