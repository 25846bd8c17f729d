//! Condition variable.
use crate::klock;
use crate::service;
use crate::sync::wait::{SyncObject, WaitQueue};
use crate::sync::Mutex;
use crate::utils::Init;
use crate::{Timeout, NO_WAIT, WAIT_INFINITE};

/// Condition variable: a stateless wait/notify point always used together
/// with an external [`Mutex`] guarding the predicate.
///
/// The usual pattern applies; waits must be wrapped in a predicate loop
/// because a wake does not imply the predicate still holds by the time
/// the waiter re-acquires the mutex:
///
/// ```ignore
/// queue_mutex.lock();
/// while !predicate() {
///     queue_cv.wait(&queue_mutex, WAIT_INFINITE);
/// }
/// // predicate holds, mutex held
/// queue_mutex.unlock();
/// ```
///
/// `notify_one` / `notify_all` are ISR-safe; `wait` is not (it blocks).
///
/// Only usable when the kernel runs with `SYNC` mode enabled.
pub struct ConditionVariable {
    wait_queue: WaitQueue,
}

impl SyncObject for ConditionVariable {
    fn wait_queue(&self) -> &WaitQueue {
        &self.wait_queue
    }
}

impl Init for ConditionVariable {
    const INIT: Self = Self {
        wait_queue: WaitQueue::INIT,
    };
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionVariable {
    pub const fn new() -> Self {
        Self::INIT
    }

    /// Atomically release `mutex`, block until notified or `timeout`
    /// expires, and re-acquire `mutex` before returning.
    ///
    /// The caller must own `mutex` at recursion depth 1. ISR-unsafe
    /// (except with `NO_WAIT`, which never blocks and returns `false`).
    ///
    /// Returns `false` on timeout.
    pub fn wait(&self, mutex: &Mutex, timeout: Timeout) -> bool {
        if timeout == NO_WAIT {
            // nothing can be consumed synchronously from a stateless
            // object
            return false;
        }

        debug_assert!(!klock::is_interrupt_context());

        let lock = klock::lock_cpu();
        let (_lock, outcome) = service::instance().start_waiting(lock, self, Some(mutex), timeout);
        !outcome.timed_out
    }

    /// [`ConditionVariable::wait`] with an infinite timeout.
    pub fn wait_infinite(&self, mutex: &Mutex) -> bool {
        self.wait(mutex, WAIT_INFINITE)
    }

    /// Wake the first waiting task, if any. ISR-safe.
    pub fn notify_one(&self) -> bool {
        let mut lock = klock::lock_cpu();
        service::instance().wake_one(&mut lock, self)
    }

    /// Wake every currently waiting task. ISR-safe.
    pub fn notify_all(&self) -> usize {
        let mut lock = klock::lock_cpu();
        service::instance().wake_all(&mut lock, self)
    }
}
