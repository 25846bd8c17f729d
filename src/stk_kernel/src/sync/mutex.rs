//! Recursive mutex.
use crate::klock::{self, CpuLockCell, CpuLockGuard};
use crate::service::{self, KernelService};
use crate::sync::wait::{SyncObject, WaitQueue};
use crate::task::Tid;
use crate::utils::Init;
use crate::{Timeout, NO_WAIT, WAIT_INFINITE};

/// Recursive mutex that allows the same task to acquire the lock multiple
/// times.
///
/// The mutex tracks ownership and a recursion count. If the owning task
/// calls [`Mutex::lock`] again, the count is incremented and the call
/// returns without blocking; the lock is only fully released when
/// [`Mutex::unlock`] has been called an equal number of times.
///
/// On the final `unlock` with tasks queued, ownership is passed directly
/// to the first waiter (FIFO order); the woken task returns from its
/// `lock` call already owning the mutex and never re-contends.
///
/// Only usable when the kernel runs with `SYNC` mode enabled.
pub struct Mutex {
    /// Task id of the current owner; `0` when free.
    owner_tid: CpuLockCell<Tid>,
    /// Recursion depth.
    count: CpuLockCell<u32>,
    wait_queue: WaitQueue,
}

impl Init for Mutex {
    const INIT: Self = Self {
        owner_tid: CpuLockCell::new(0),
        count: CpuLockCell::new(0),
        wait_queue: WaitQueue::INIT,
    };
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncObject for Mutex {
    fn wait_queue(&self) -> &WaitQueue {
        &self.wait_queue
    }
}

impl Mutex {
    pub const fn new() -> Self {
        Self::INIT
    }

    /// Acquire the lock, waiting at most `timeout` ticks.
    ///
    /// ISR-unsafe. Returns `true` if the lock was acquired, `false` if the
    /// timeout expired first.
    pub fn timed_lock(&self, timeout: Timeout) -> bool {
        // not supported inside an ISR (may block, and ownership needs a
        // task id)
        debug_assert!(!klock::is_interrupt_context());

        let svc = service::instance();
        let current_tid = svc.current_tid();

        let mut lock = klock::lock_cpu();

        // already owned by the calling task (recursive path)
        if self.count.get(&*lock) != 0 && self.owner_tid.get(&*lock) == current_tid {
            let count = self.count.get(&*lock) + 1;
            assert!(count <= 0xffff, "mutex recursion depth exceeded");
            self.count.replace(&mut *lock, count);
            return true;
        }

        // the mutex is free (fast path)
        if self.count.get(&*lock) == 0 {
            self.count.replace(&mut *lock, 1);
            self.owner_tid.replace(&mut *lock, current_tid);
            return true;
        }

        // try-lock behavior
        if timeout == NO_WAIT {
            return false;
        }

        // owned by another task (slow path)
        let (lock, outcome) = svc.start_waiting(lock, self, None, timeout);
        if outcome.timed_out {
            return false;
        }

        // ownership was handed over by `unlock`
        debug_assert_eq!(self.count.get(&*lock), 1);
        debug_assert_eq!(self.owner_tid.get(&*lock), current_tid);

        true
    }

    /// Acquire the lock. ISR-unsafe.
    pub fn lock(&self) {
        let _ = self.timed_lock(WAIT_INFINITE);
    }

    /// Acquire the lock without blocking. ISR-unsafe.
    ///
    /// Returns `false` if the mutex is held by another task.
    pub fn try_lock(&self) -> bool {
        self.timed_lock(NO_WAIT)
    }

    /// Release the lock. ISR-unsafe.
    ///
    /// Asserts that the caller owns the mutex.
    pub fn unlock(&self) {
        debug_assert!(!klock::is_interrupt_context());

        let svc = service::instance();
        let current_tid = svc.current_tid();

        let mut lock = klock::lock_cpu();

        // ensure the caller actually owns the mutex
        assert!(
            self.count.get(&*lock) != 0 && self.owner_tid.get(&*lock) == current_tid,
            "unlocking a mutex not owned by the current task"
        );

        let count = self.count.get(&*lock) - 1;
        self.count.replace(&mut *lock, count);

        if count == 0 {
            self.release_to_next_waiter(&mut lock, svc);
        }
    }

    /// Final-release step: hand ownership to the first waiter, or free the
    /// mutex when nobody is queued. `count` must be `0`.
    fn release_to_next_waiter(&self, lock: &mut CpuLockGuard, svc: &dyn KernelService) {
        debug_assert_eq!(self.count.get(&**lock), 0);

        if let Some(waiter_tid) = svc.first_waiter_tid(lock, self) {
            // pass ownership directly to the first waiter (FIFO order)
            self.count.replace(&mut **lock, 1);
            self.owner_tid.replace(&mut **lock, waiter_tid);

            svc.wake_one(lock, self);
        } else {
            // free completely, there are no waiters
            self.owner_tid.replace(&mut **lock, 0);
        }
    }

    /// Fully release the mutex on behalf of a condition wait, on behalf
    /// of the task with id `tid`, which must own the mutex at recursion
    /// depth 1. The caller already holds CPU Lock.
    pub(crate) fn release_for_wait(
        &self,
        lock: &mut CpuLockGuard,
        svc: &dyn KernelService,
        tid: Tid,
    ) {
        assert!(
            self.count.get(&**lock) != 0 && self.owner_tid.get(&**lock) == tid,
            "condition wait over a mutex the task does not own"
        );
        assert_eq!(
            self.count.get(&**lock),
            1,
            "condition wait over a recursively held mutex"
        );

        self.count.replace(&mut **lock, 0);
        self.release_to_next_waiter(lock, svc);
    }

    /// Re-acquire the mutex for the task with id `tid` after a condition
    /// wait, keeping the caller's CPU Lock guard across the operation.
    pub(crate) fn reacquire_after_wait(
        &self,
        mut lock: CpuLockGuard,
        svc: &dyn KernelService,
        tid: Tid,
    ) -> CpuLockGuard {
        if self.count.get(&*lock) == 0 {
            self.count.replace(&mut *lock, 1);
            self.owner_tid.replace(&mut *lock, tid);
            return lock;
        }

        if self.owner_tid.get(&*lock) == tid {
            // the releasing side already handed the mutex back to us
            return lock;
        }

        let (lock, outcome) = svc.start_waiting(lock, self, None, WAIT_INFINITE);
        debug_assert!(!outcome.timed_out);
        debug_assert_eq!(self.owner_tid.get(&*lock), tid);
        lock
    }
}
