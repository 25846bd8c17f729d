//! The run-time kernel service.
//!
//! [`KernelService`] is the façade task code talks to while the kernel is
//! scheduling: tick time, sleep/delay/yield, the TLS slot, and the
//! `start_waiting` building block the synchronization primitives are made
//! of. The running kernel publishes itself here at start; [`instance`]
//! hands the singleton out to anyone (there is one kernel per core, and
//! one core per process in every supported configuration).
use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::klock::CpuLockGuard;
use crate::sync::wait::{SyncObject, WaitOutcome};
use crate::sync::Mutex;
use crate::task::Tid;
use crate::Timeout;

/// Convert a millisecond interval to ticks for a given tick resolution.
#[inline]
pub fn ticks_from_ms(ms: u32, resolution_us: i32) -> i64 {
    debug_assert!(resolution_us > 0);
    ms as i64 * 1000 / resolution_us as i64
}

/// Run-time services exposed to task code by the started kernel.
pub trait KernelService: Sync {
    /// Number of ticks elapsed since the kernel was started.
    fn ticks(&self) -> i64;

    /// Number of microseconds in one tick.
    fn tick_resolution_us(&self) -> i32;

    /// Current tick deadline for an interval of `deadline_ms`.
    fn deadline_ticks(&self, deadline_ms: u32) -> i64 {
        self.ticks() + ticks_from_ms(deadline_ms, self.tick_resolution_us())
    }

    /// Busy-wait for `delay_ms`, spinning on the tick counter with a CPU
    /// relax hint. Does not yield the processor.
    fn delay(&self, delay_ms: u32);

    /// Put the calling task to sleep for `sleep_ms`.
    ///
    /// Not available in HRT mode (asserts): HRT tasks sleep only through
    /// their periodicity.
    fn sleep(&self, sleep_ms: u32);

    /// Yield the processor: ask the kernel to switch to the next task. In
    /// HRT mode this also declares the current period's work complete.
    fn switch_to_next(&self);

    /// Id of the calling task; `0` in an interrupt context.
    fn current_tid(&self) -> Tid;

    /// The calling task's opaque TLS slot.
    fn tls_ptr(&self) -> *mut ();

    /// Replace the calling task's opaque TLS slot.
    fn set_tls_ptr(&self, ptr: *mut ());

    /// Park the calling task on `sync`'s wait queue.
    ///
    /// The atomic building block of every blocking primitive: releases
    /// `release` (if given) while still inside the critical section,
    /// queues a waiter record on `sync` and on the global timeout chain,
    /// blocks until woken or timed out, re-acquires `release`, and
    /// reports which of the two happened.
    ///
    /// `timeout` is in ticks; negative waits forever. Must not be called
    /// with `timeout == 0` (the fast path belongs to the caller) nor from
    /// an interrupt context.
    #[doc(hidden)]
    fn start_waiting(
        &self,
        lock: CpuLockGuard,
        sync: &dyn SyncObject,
        release: Option<&Mutex>,
        timeout: Timeout,
    ) -> (CpuLockGuard, WaitOutcome);

    /// Wake the first waiter queued on `sync`, if any.
    #[doc(hidden)]
    fn wake_one(&self, lock: &mut CpuLockGuard, sync: &dyn SyncObject) -> bool;

    /// Wake every waiter currently queued on `sync`.
    #[doc(hidden)]
    fn wake_all(&self, lock: &mut CpuLockGuard, sync: &dyn SyncObject) -> usize;

    /// Task id of the first waiter queued on `sync`, if any.
    #[doc(hidden)]
    fn first_waiter_tid(&self, lock: &mut CpuLockGuard, sync: &dyn SyncObject) -> Option<Tid>;
}

struct InstanceCell(UnsafeCell<Option<&'static dyn KernelService>>);

// Safety: written before the first task runs (guarded by `BOUND`),
// read-only afterwards.
unsafe impl Sync for InstanceCell {}

static INSTANCE: InstanceCell = InstanceCell(UnsafeCell::new(None));
static BOUND: AtomicBool = AtomicBool::new(false);

/// The kernel service of the running kernel.
///
/// Available once [`crate::kernel::Kernel::start`] published it; panics
/// before that.
#[inline]
pub fn instance() -> &'static dyn KernelService {
    try_instance().expect("kernel service is not bound (kernel not started)")
}

/// [`instance`], but `None` when no kernel has been started yet.
#[inline]
pub fn try_instance() -> Option<&'static dyn KernelService> {
    if BOUND.load(Ordering::Acquire) {
        // Safety: no more writes happen while `BOUND` is set
        unsafe { *INSTANCE.0.get() }
    } else {
        None
    }
}

/// Publish `svc` as the process-wide kernel service. The first kernel to
/// start wins; subsequent binds are ignored.
pub(crate) fn bind(svc: &'static dyn KernelService) {
    if BOUND.load(Ordering::Relaxed) {
        return;
    }
    unsafe { *INSTANCE.0.get() = Some(svc) };
    BOUND.store(true, Ordering::Release);
}

/// Tear the singleton down so another kernel can be started by the same
/// process. Only sound once the previous kernel has fully stopped and no
/// task code is running.
#[cfg(any(test, feature = "test_support"))]
pub fn unbind() {
    BOUND.store(false, Ordering::Release);
    unsafe { *INSTANCE.0.get() = None };
}
