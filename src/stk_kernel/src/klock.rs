//! Kernel state locking mechanism.
//!
//! The whole kernel state is guarded by a single system-wide critical
//! section ("CPU Lock"): interrupts masked on the executing core. Holding
//! CPU Lock is witnessed by a singleton token; kernel state cells can only
//! be accessed through that token, which makes an access outside the
//! critical section a compile error rather than a race.
//!
//! The actual enter/leave primitives belong to the bound platform and are
//! installed by [`crate::kernel::Kernel::initialize`]. Before a platform is
//! bound they are no-ops, which is sufficient for the single-threaded
//! configuration phase.
use core::{cell::UnsafeCell, ops, sync::atomic::{AtomicBool, Ordering}};
use tokenlock::UnsyncTokenLock;

use crate::{port::Port, utils::Init};

pub struct CpuLockTag;

/// The key that "unlocks" [`CpuLockCell`].
pub type CpuLockToken = tokenlock::UnsyncSingletonToken<CpuLockTag>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub type CpuLockKeyhole = tokenlock::SingletonTokenId<CpuLockTag>;

/// Borrowed version of [`CpuLockGuard`]. This is equivalent to
/// `&'a mut CpuLockGuard` but does not consume memory.
pub type CpuLockTokenRefMut<'a> = tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag>;

/// Immutably borrowed version of [`CpuLockGuard`].
pub type CpuLockTokenRef<'a> = tokenlock::UnsyncSingletonTokenRef<'a, CpuLockTag>;

/// Cell type that can be accessed by [`CpuLockToken`] (which can be obtained
/// by [`lock_cpu`]).
pub struct CpuLockCell<T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole>);

impl<T> CpuLockCell<T> {
    pub const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::new(), x))
    }
}

impl<T: Init> Init for CpuLockCell<T> {
    const INIT: Self = Self(Init::INIT);
}

impl<T> ops::Deref for CpuLockCell<T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> ops::DerefMut for CpuLockCell<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// The platform primitives behind CPU Lock, installed by the kernel when a
/// platform is bound.
#[derive(Clone, Copy)]
pub(crate) struct LockOps {
    pub enter: unsafe fn(),
    pub leave: unsafe fn(),
    pub is_active: fn() -> bool,
    pub is_interrupt_context: fn() -> bool,
    pub relax: fn(),
}

fn never_active() -> bool {
    false
}

fn no_relax() {}

unsafe fn no_mask() {}

const NOOP_OPS: LockOps = LockOps {
    enter: no_mask,
    leave: no_mask,
    is_active: never_active,
    is_interrupt_context: never_active,
    relax: no_relax,
};

struct LockOpsCell(UnsafeCell<LockOps>);

// Safety: written once by `install` during the single-threaded
// configuration phase, read-only afterwards (guarded by `OPS_INSTALLED`).
unsafe impl Sync for LockOpsCell {}

static OPS: LockOpsCell = LockOpsCell(UnsafeCell::new(NOOP_OPS));
static OPS_CLAIMED: AtomicBool = AtomicBool::new(false);
static OPS_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install `P`'s masking primitives. Called by the kernel while binding a
/// platform, before scheduling starts. The first platform wins; there is
/// one kernel instance per core, so a second caller is necessarily the
/// same platform.
pub(crate) fn install<P: Port>() {
    if OPS_CLAIMED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    unsafe {
        *OPS.0.get() = LockOps {
            enter: P::enter_cpu_lock,
            leave: P::leave_cpu_lock,
            is_active: P::is_cpu_lock_active,
            is_interrupt_context: P::is_interrupt_context,
            relax: P::relax_cpu,
        };
    }
    OPS_INSTALLED.store(true, Ordering::Release);
}

#[inline]
pub(crate) fn ops() -> &'static LockOps {
    if OPS_INSTALLED.load(Ordering::Acquire) {
        // Safety: no more writes happen after `OPS_INSTALLED` is set
        unsafe { &*OPS.0.get() }
    } else {
        &NOOP_OPS
    }
}

/// Issue a CPU relax hint (spin-wait body).
#[inline]
pub(crate) fn relax_cpu() {
    (ops().relax)()
}

/// Whether the current context is an interrupt handler.
#[inline]
pub(crate) fn is_interrupt_context() -> bool {
    (ops().is_interrupt_context)()
}

/// Enter a CPU Lock state and get an RAII guard.
pub(crate) fn lock_cpu() -> CpuLockGuard {
    // Safety: `enter` is only meant to be called by the kernel
    unsafe { (ops().enter)() };
    // Safety: We just entered a CPU Lock state. This also means there are
    //         no instances of `CpuLockGuard` existing at this point.
    unsafe { assume_cpu_lock() }
}

/// Assume a CPU Lock state and get `CpuLockGuard`.
///
/// # Safety
///
/// The system must be really in a CPU Lock state. There must be no instances
/// of `CpuLockGuard` existing at the point of the call.
pub(crate) unsafe fn assume_cpu_lock() -> CpuLockGuard {
    CpuLockGuard {
        // Safety: There are no other instances of `CpuLockToken`; this is
        //         upheld by the caller.
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// RAII guard for a CPU Lock state.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub struct CpuLockGuard {
    token: CpuLockToken,
}

impl CpuLockGuard {
    /// Construct a [`CpuLockTokenRefMut`] by borrowing `self`.
    pub fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_> {
        self.token.borrow_mut()
    }
}

impl Drop for CpuLockGuard {
    fn drop(&mut self) {
        // Safety: CPU Lock is currently active, and it's us (the kernel) who
        // are currently controlling the CPU Lock state
        unsafe {
            (ops().leave)();
        }
    }
}

impl ops::Deref for CpuLockGuard {
    type Target = CpuLockToken;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl ops::DerefMut for CpuLockGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Momentarily release CPU Lock, letting the tick interrupt (and thus the
/// scheduler) in, then re-acquire it.
///
/// The guard is conceptually dead during the gap; the caller must not use
/// any token borrowed from it across this call.
pub(crate) fn pause_cpu_lock(_guard: &mut CpuLockGuard) {
    let ops = ops();
    debug_assert!((ops.is_active)() || !OPS_INSTALLED.load(Ordering::Relaxed));
    // Safety: (1) We don't access resources protected by CPU Lock during
    //         the gap. (2) We currently have CPU Lock. (3) We re-acquire
    //         it before returning from this function.
    unsafe { (ops.leave)() };
    (ops.relax)();
    unsafe { (ops.enter)() };
}
