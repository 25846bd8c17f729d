//! Counting semaphore.
use crate::klock::{self, CpuLockCell};
use crate::service;
use crate::sync::wait::{SyncObject, WaitQueue};
use crate::utils::Init;
use crate::{Timeout, NO_WAIT, WAIT_INFINITE};

/// Counting semaphore for resource management and signaling.
///
/// The semaphore maintains an internal counter. Unlike a condition
/// variable it is stateful: a [`Semaphore::signal`] with no task waiting
/// is remembered by incrementing the counter.
///
/// Direct-handover policy: when a task is waiting, `signal` gives the
/// resource token directly to the first task in the wait list without
/// touching the counter; the woken task owns the token on return from
/// [`Semaphore::wait`] and does not decrement anything either.
///
/// Only usable when the kernel runs with `SYNC` mode enabled.
pub struct Semaphore {
    count: CpuLockCell<u32>,
    wait_queue: WaitQueue,
}

impl SyncObject for Semaphore {
    fn wait_queue(&self) -> &WaitQueue {
        &self.wait_queue
    }
}

impl Semaphore {
    pub const fn new(initial_count: u32) -> Self {
        Self {
            count: CpuLockCell::new(initial_count),
            wait_queue: WaitQueue::INIT,
        }
    }

    /// Wait for a permit (decrement the counter), at most `timeout` ticks.
    ///
    /// ISR-unsafe, except with `NO_WAIT` (which never blocks). Returns
    /// `false` on timeout.
    pub fn wait(&self, timeout: Timeout) -> bool {
        let mut lock = klock::lock_cpu();

        // fast path: a permit is available
        let count = self.count.get(&*lock);
        if count != 0 {
            self.count.replace(&mut *lock, count - 1);
            return true;
        }

        // try-wait behavior
        if timeout == NO_WAIT {
            return false;
        }

        // not supported inside an ISR beyond this point, may block
        debug_assert!(!klock::is_interrupt_context());

        // block until `signal` hands a token over or the timeout fires;
        // the handed-over token never touches the counter
        let (_lock, outcome) = service::instance().start_waiting(lock, self, None, timeout);
        !outcome.timed_out
    }

    /// [`Semaphore::wait`] with an infinite timeout.
    pub fn wait_infinite(&self) -> bool {
        self.wait(WAIT_INFINITE)
    }

    /// Post a permit. ISR-safe.
    ///
    /// Gives the token directly to the first waiting task; the counter is
    /// only incremented when nobody is waiting.
    pub fn signal(&self) {
        let mut lock = klock::lock_cpu();

        if self.wait_queue.is_empty() {
            // no one is waiting, save the signal for later
            let count = self.count.get(&*lock);
            self.count.replace(&mut *lock, count + 1);
        } else {
            // hand the token directly to the first waiting task
            service::instance().wake_one(&mut lock, self);
        }
    }

    /// Current counter value. ISR-safe.
    pub fn count(&self) -> u32 {
        let lock = klock::lock_cpu();
        self.count.get(&*lock)
    }
}
