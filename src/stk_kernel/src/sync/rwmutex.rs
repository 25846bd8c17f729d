//! Reader-writer mutex.
use crate::klock::{self};
use crate::sync::{ConditionVariable, Mutex};
use crate::utils::Init;
use crate::{Timeout, NO_WAIT, WAIT_INFINITE};

/// Writer-preference reader-writer mutex.
///
/// Any number of readers may hold the lock concurrently; writers get
/// exclusive access. A waiting writer blocks new readers from entering,
/// which keeps writers from starving on a busy read path.
///
/// Built from an internal [`Mutex`] guarding the counters and two
/// [`ConditionVariable`]s, one for each side. Not recursive on either
/// side. ISR-unsafe.
///
/// Only usable when the kernel runs with `SYNC` mode enabled.
pub struct RwMutex {
    m: Mutex,
    readers_cv: ConditionVariable,
    writers_cv: ConditionVariable,
    state: klock::CpuLockCell<RwState>,
}

#[derive(Clone, Copy)]
struct RwState {
    /// Number of active readers.
    readers: u32,
    /// A writer currently holds the lock.
    writer_active: bool,
    /// Number of writers queued on `writers_cv`.
    writers_waiting: u32,
}

impl Init for RwMutex {
    const INIT: Self = Self {
        m: Mutex::INIT,
        readers_cv: ConditionVariable::INIT,
        writers_cv: ConditionVariable::INIT,
        state: klock::CpuLockCell::new(RwState {
            readers: 0,
            writer_active: false,
            writers_waiting: 0,
        }),
    };
}

impl Default for RwMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RwMutex {
    pub const fn new() -> Self {
        Self::INIT
    }

    #[inline]
    fn state_get(&self) -> RwState {
        let lock = klock::lock_cpu();
        self.state.get(&*lock)
    }

    #[inline]
    fn state_update(&self, f: impl FnOnce(&mut RwState)) -> RwState {
        let mut lock = klock::lock_cpu();
        let mut s = self.state.get(&*lock);
        f(&mut s);
        self.state.replace(&mut *lock, s);
        s
    }

    /// Acquire the lock for shared (read) access, waiting at most
    /// `timeout` ticks. Returns `false` on timeout.
    pub fn timed_read_lock(&self, timeout: Timeout) -> bool {
        if !self.m.timed_lock(timeout) {
            return false;
        }

        // writer preference: also stand aside while writers are queued
        loop {
            let s = self.state_get();
            if !s.writer_active && s.writers_waiting == 0 {
                break;
            }
            if timeout == NO_WAIT || !self.readers_cv.wait(&self.m, timeout) {
                self.m.unlock();
                return false;
            }
        }

        self.state_update(|s| s.readers += 1);
        self.m.unlock();
        true
    }

    /// Acquire the lock for shared (read) access.
    pub fn read_lock(&self) {
        let _ = self.timed_read_lock(WAIT_INFINITE);
    }

    /// Release a shared (read) hold.
    pub fn read_unlock(&self) {
        self.m.lock();
        let s = self.state_update(|s| {
            assert!(s.readers != 0, "read_unlock without a read hold");
            s.readers -= 1;
        });
        self.m.unlock();

        // the last reader lets one queued writer in
        if s.readers == 0 {
            self.writers_cv.notify_one();
        }
    }

    /// Acquire the lock for exclusive (write) access, waiting at most
    /// `timeout` ticks. Returns `false` on timeout.
    pub fn timed_lock(&self, timeout: Timeout) -> bool {
        if !self.m.timed_lock(timeout) {
            return false;
        }

        self.state_update(|s| s.writers_waiting += 1);
        loop {
            let s = self.state_get();
            if !s.writer_active && s.readers == 0 {
                break;
            }
            if timeout == NO_WAIT || !self.writers_cv.wait(&self.m, timeout) {
                self.state_update(|s| s.writers_waiting -= 1);
                self.m.unlock();
                return false;
            }
        }
        self.state_update(|s| {
            s.writers_waiting -= 1;
            s.writer_active = true;
        });

        self.m.unlock();
        true
    }

    /// Acquire the lock for exclusive (write) access.
    pub fn lock(&self) {
        let _ = self.timed_lock(WAIT_INFINITE);
    }

    /// Release an exclusive (write) hold.
    pub fn unlock(&self) {
        self.m.lock();
        let s = self.state_update(|s| {
            assert!(s.writer_active, "unlock without a write hold");
            s.writer_active = false;
        });
        self.m.unlock();

        if s.writers_waiting != 0 {
            self.writers_cv.notify_one();
        } else {
            self.readers_cv.notify_all();
        }
    }

    /// Acquire for read without blocking.
    pub fn try_read_lock(&self) -> bool {
        self.timed_read_lock(NO_WAIT)
    }

    /// Acquire for write without blocking.
    pub fn try_lock(&self) -> bool {
        self.timed_lock(NO_WAIT)
    }
}
