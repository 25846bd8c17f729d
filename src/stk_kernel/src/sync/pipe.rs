//! Bounded pipe (ring buffer).
use core::cell::{Cell, UnsafeCell};
use core::mem::MaybeUninit;

use crate::klock;
use crate::service::{self, KernelService};
use crate::sync::{ConditionVariable, Mutex};
use crate::{Timeout, NO_WAIT, WAIT_INFINITE};

/// Bounded single-direction pipe of capacity `N`.
///
/// A ring buffer guarded by an internal [`Mutex`] with two
/// [`ConditionVariable`]s providing back-pressure: writers block while
/// the pipe is full, readers block while it is empty.
///
/// The bulk operations ([`Pipe::write_all`] / [`Pipe::read_all`], for
/// `T: Copy`) move contiguous runs, splitting at the buffer wrap; under
/// contention they may return a partial count when the timeout expires.
///
/// ISR-unsafe (uses the internal mutex). Only usable when the kernel runs
/// with `SYNC` mode enabled.
pub struct Pipe<T, const N: usize> {
    m: Mutex,
    not_empty: ConditionVariable,
    not_full: ConditionVariable,
    buf: UnsafeCell<[MaybeUninit<T>; N]>,
    /// Write position.
    head: Cell<usize>,
    /// Read position.
    tail: Cell<usize>,
    /// Number of stored elements; `0 <= count <= N`.
    count: Cell<usize>,
}

// Safety: the buffer and indices are only touched while the internal
// mutex is held.
unsafe impl<T: Send, const N: usize> Sync for Pipe<T, N> {}
unsafe impl<T: Send, const N: usize> Send for Pipe<T, N> {}

impl<T, const N: usize> Pipe<T, N> {
    pub const fn new() -> Self {
        assert!(N > 0, "pipe capacity must be non-zero");
        Self {
            m: Mutex::new(),
            not_empty: ConditionVariable::new(),
            not_full: ConditionVariable::new(),
            // Safety: an array of `MaybeUninit` doesn't require
            // initialization
            buf: UnsafeCell::new(unsafe { MaybeUninit::uninit().assume_init() }),
            head: Cell::new(0),
            tail: Cell::new(0),
            count: Cell::new(0),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of stored elements.
    pub fn len(&self) -> usize {
        self.m.lock();
        let n = self.count.get();
        self.m.unlock();
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deposit `value`, blocking while the pipe is full.
    ///
    /// Returns `false` when `timeout` expired before space was available
    /// (the value is dropped in that case).
    pub fn write(&self, value: T, timeout: Timeout) -> bool {
        debug_assert!(!klock::is_interrupt_context());

        let svc = service::instance();
        let deadline = wait_deadline(svc, timeout);

        if !self.m.timed_lock(timeout) {
            return false;
        }

        while self.count.get() == N {
            let remaining = remaining_ticks(svc, timeout, deadline);
            if remaining == NO_WAIT || !self.not_full.wait(&self.m, remaining) {
                self.m.unlock();
                return false;
            }
        }

        let head = self.head.get();
        // Safety: slot `head` is unoccupied (`count < N`) and we hold the
        // internal mutex
        unsafe {
            (*self.buf.get())[head].write(value);
        }
        self.head.set((head + 1) % N);
        self.count.set(self.count.get() + 1);

        self.m.unlock();
        self.not_empty.notify_one();
        true
    }

    /// Consume one element, blocking while the pipe is empty.
    ///
    /// Returns `None` when `timeout` expired first.
    pub fn read(&self, timeout: Timeout) -> Option<T> {
        debug_assert!(!klock::is_interrupt_context());

        let svc = service::instance();
        let deadline = wait_deadline(svc, timeout);

        if !self.m.timed_lock(timeout) {
            return None;
        }

        while self.count.get() == 0 {
            let remaining = remaining_ticks(svc, timeout, deadline);
            if remaining == NO_WAIT || !self.not_empty.wait(&self.m, remaining) {
                self.m.unlock();
                return None;
            }
        }

        let tail = self.tail.get();
        // Safety: slot `tail` holds an initialized element (`count > 0`)
        let value = unsafe { (*self.buf.get())[tail].assume_init_read() };
        self.tail.set((tail + 1) % N);
        self.count.set(self.count.get() - 1);

        self.m.unlock();
        self.not_full.notify_one();
        Some(value)
    }

    /// [`Pipe::write`] with an infinite timeout.
    pub fn write_infinite(&self, value: T) -> bool {
        self.write(value, WAIT_INFINITE)
    }

    /// [`Pipe::read`] with an infinite timeout.
    pub fn read_infinite(&self) -> Option<T> {
        self.read(WAIT_INFINITE)
    }
}

impl<T: Copy, const N: usize> Pipe<T, N> {
    /// Deposit every element of `data`, in contiguous runs split at the
    /// buffer wrap. Returns the number of elements written, which is less
    /// than `data.len()` when the timeout expired mid-transfer.
    pub fn write_all(&self, data: &[T], timeout: Timeout) -> usize {
        debug_assert!(!klock::is_interrupt_context());

        let svc = service::instance();
        let deadline = wait_deadline(svc, timeout);

        if !self.m.timed_lock(timeout) {
            return 0;
        }

        let mut written = 0;
        'outer: while written < data.len() {
            while self.count.get() == N {
                let remaining = remaining_ticks(svc, timeout, deadline);
                if remaining == NO_WAIT || !self.not_full.wait(&self.m, remaining) {
                    break 'outer;
                }
            }

            let head = self.head.get();
            let run = (data.len() - written)
                .min(N - self.count.get())
                .min(N - head);
            // Safety: `run` slots starting at `head` are unoccupied and we
            // hold the internal mutex
            unsafe {
                let dst = (*self.buf.get()).as_mut_ptr().add(head) as *mut T;
                core::ptr::copy_nonoverlapping(data.as_ptr().add(written), dst, run);
            }
            self.head.set((head + run) % N);
            self.count.set(self.count.get() + run);
            written += run;

            self.not_empty.notify_one();
        }

        self.m.unlock();
        written
    }

    /// Consume up to `out.len()` elements, in contiguous runs split at
    /// the buffer wrap. Returns the number of elements read, which is
    /// less than `out.len()` when the timeout expired mid-transfer.
    pub fn read_all(&self, out: &mut [T], timeout: Timeout) -> usize {
        debug_assert!(!klock::is_interrupt_context());

        let svc = service::instance();
        let deadline = wait_deadline(svc, timeout);

        if !self.m.timed_lock(timeout) {
            return 0;
        }

        let mut read = 0;
        'outer: while read < out.len() {
            while self.count.get() == 0 {
                let remaining = remaining_ticks(svc, timeout, deadline);
                if remaining == NO_WAIT || !self.not_empty.wait(&self.m, remaining) {
                    break 'outer;
                }
            }

            let tail = self.tail.get();
            let run = (out.len() - read).min(self.count.get()).min(N - tail);
            // Safety: `run` slots starting at `tail` hold initialized
            // elements and we hold the internal mutex
            unsafe {
                let src = (*self.buf.get()).as_ptr().add(tail) as *const T;
                core::ptr::copy_nonoverlapping(src, out.as_mut_ptr().add(read), run);
            }
            self.tail.set((tail + run) % N);
            self.count.set(self.count.get() - run);
            read += run;

            self.not_full.notify_one();
        }

        self.m.unlock();
        read
    }
}

impl<T, const N: usize> Drop for Pipe<T, N> {
    fn drop(&mut self) {
        // release the elements still in transit
        let mut tail = self.tail.get();
        for _ in 0..self.count.get() {
            // Safety: `count` slots starting at `tail` are initialized
            unsafe { (*self.buf.get())[tail].assume_init_drop() };
            tail = (tail + 1) % N;
        }
    }
}

impl<T, const N: usize> Default for Pipe<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Absolute tick deadline of a timed wait; meaningless for `NO_WAIT` and
/// infinite timeouts.
#[inline]
fn wait_deadline(svc: &dyn KernelService, timeout: Timeout) -> i64 {
    if timeout > 0 {
        svc.ticks() + timeout as i64
    } else {
        0
    }
}

/// Ticks left until `deadline`, expressed as a [`Timeout`].
#[inline]
fn remaining_ticks(svc: &dyn KernelService, timeout: Timeout, deadline: i64) -> Timeout {
    if timeout < 0 {
        WAIT_INFINITE
    } else if timeout == NO_WAIT {
        NO_WAIT
    } else {
        let left = deadline - svc.ticks();
        if left <= 0 {
            NO_WAIT
        } else {
            left as Timeout
        }
    }
}
