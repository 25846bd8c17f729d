//! Recursive, cooperatively-yielding spin lock.
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::klock;
use crate::service;
use crate::task::Tid;

/// Default number of spin iterations before the lock yields the CPU.
pub const SPIN_COUNT_DEFAULT: u32 = 64;

/// Recursive spin lock.
///
/// Same ownership discipline as [`crate::sync::Mutex`], but the outermost
/// acquisition spins on a hardware-atomic lock word instead of parking on
/// a wait list: up to `spin_count` CPU relax hints, then a cooperative
/// yield, then another round. It therefore has no timeouts and is usable
/// across kernel instances on multi-core parts.
///
/// ISR-unsafe (ownership is tied to a task id).
pub struct SpinLock {
    /// The hardware-atomic inner lock word. `1` = held.
    lock_word: AtomicU32,
    /// Task id of the current owner; only written while `lock_word` is
    /// held.
    owner_tid: AtomicUsize,
    /// Recursion depth; only touched by the owner.
    count: AtomicU32,
    /// Spin budget between yields.
    spin_count: u32,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self::with_spin_count(SPIN_COUNT_DEFAULT)
    }

    /// A spin lock yielding after `spin_count` failed spins.
    pub const fn with_spin_count(spin_count: u32) -> Self {
        Self {
            lock_word: AtomicU32::new(0),
            owner_tid: AtomicUsize::new(0),
            count: AtomicU32::new(0),
            spin_count,
        }
    }

    /// Acquire the lock, spinning (and periodically yielding) until it is
    /// available. ISR-unsafe.
    pub fn lock(&self) {
        debug_assert!(!klock::is_interrupt_context());

        let svc = service::instance();
        let current_tid = svc.current_tid();

        // recursive path
        if self.owner(current_tid) {
            let count = self.count.load(Ordering::Relaxed) + 1;
            assert!(count <= 0xfffe, "spin lock recursion depth exceeded");
            self.count.store(count, Ordering::Relaxed);
            return;
        }

        loop {
            if self.try_acquire(current_tid) {
                return;
            }

            // busy-spin within the budget, then let someone else run
            for _ in 0..self.spin_count {
                if self.lock_word.load(Ordering::Relaxed) == 0 {
                    break;
                }
                klock::relax_cpu();
            }
            if self.lock_word.load(Ordering::Relaxed) != 0 {
                svc.switch_to_next();
            }
        }
    }

    /// Acquire the lock without blocking. ISR-unsafe.
    pub fn try_lock(&self) -> bool {
        debug_assert!(!klock::is_interrupt_context());

        let current_tid = service::instance().current_tid();

        if self.owner(current_tid) {
            let count = self.count.load(Ordering::Relaxed) + 1;
            assert!(count <= 0xfffe, "spin lock recursion depth exceeded");
            self.count.store(count, Ordering::Relaxed);
            return true;
        }

        self.try_acquire(current_tid)
    }

    /// Release the lock. Asserts that the caller owns it.
    pub fn unlock(&self) {
        debug_assert!(!klock::is_interrupt_context());

        let current_tid = service::instance().current_tid();
        assert!(
            self.owner(current_tid),
            "unlocking a spin lock not owned by the current task"
        );

        let count = self.count.load(Ordering::Relaxed) - 1;
        self.count.store(count, Ordering::Relaxed);

        if count == 0 {
            self.owner_tid.store(0, Ordering::Relaxed);
            self.lock_word.store(0, Ordering::Release);
        }
    }

    #[inline]
    fn owner(&self, tid: Tid) -> bool {
        self.lock_word.load(Ordering::Acquire) != 0
            && self.owner_tid.load(Ordering::Relaxed) == tid
    }

    #[inline]
    fn try_acquire(&self, tid: Tid) -> bool {
        if self
            .lock_word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner_tid.store(tid, Ordering::Relaxed);
            self.count.store(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}
