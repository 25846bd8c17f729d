//! The critical-section primitive.
use crate::klock::{self, CpuLockGuard};

/// RAII-style low-level synchronization primitive for atomic code
/// execution.
///
/// Disables the kernel's interrupts on the calling core for the lifetime
/// of the value. Used as the building brick of the other `sync` types.
///
/// Use with care: this has a global effect on the system by preventing
/// preemption, and long-running code inside a critical section increases
/// interrupt latency. No blocking primitive may be invoked while one is
/// held; spinning is the only valid wait inside a critical section.
///
/// Unlike the higher-level primitives this is always available and does
/// not depend on the kernel's `SYNC` mode.
pub struct ScopedCriticalSection {
    _guard: CpuLockGuard,
}

impl ScopedCriticalSection {
    /// Enter the critical section; left again on drop.
    pub fn enter() -> Self {
        Self {
            _guard: klock::lock_cpu(),
        }
    }
}
