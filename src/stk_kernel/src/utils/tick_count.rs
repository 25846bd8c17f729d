//! 64-bit monotonic tick counter readable from task context without a lock.
use core::sync::atomic::Ordering;

/// Monotonic tick counter.
///
/// The writer is the tick interrupt handler; readers are tasks. On targets
/// with 64-bit atomics a single atomic load suffices. Elsewhere the counter
/// is split into two words and readers use a hi-lo-hi double-read retry loop,
/// which is sound because the writer publishes the low word last.
pub struct TickCount {
    #[cfg(target_has_atomic = "64")]
    value: core::sync::atomic::AtomicI64,
    #[cfg(not(target_has_atomic = "64"))]
    hi: core::sync::atomic::AtomicU32,
    #[cfg(not(target_has_atomic = "64"))]
    lo: core::sync::atomic::AtomicU32,
}

impl TickCount {
    pub const fn new() -> Self {
        Self {
            #[cfg(target_has_atomic = "64")]
            value: core::sync::atomic::AtomicI64::new(0),
            #[cfg(not(target_has_atomic = "64"))]
            hi: core::sync::atomic::AtomicU32::new(0),
            #[cfg(not(target_has_atomic = "64"))]
            lo: core::sync::atomic::AtomicU32::new(0),
        }
    }

    #[cfg(target_has_atomic = "64")]
    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    #[cfg(target_has_atomic = "64")]
    #[inline]
    pub fn increment(&self) {
        // The tick handler is the only writer.
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(not(target_has_atomic = "64"))]
    #[inline]
    pub fn get(&self) -> i64 {
        loop {
            let hi0 = self.hi.load(Ordering::Acquire);
            let lo = self.lo.load(Ordering::Acquire);
            let hi1 = self.hi.load(Ordering::Acquire);
            if hi0 == hi1 {
                return (((hi0 as u64) << 32) | lo as u64) as i64;
            }
        }
    }

    #[cfg(not(target_has_atomic = "64"))]
    #[inline]
    pub fn increment(&self) {
        let lo = self.lo.load(Ordering::Relaxed);
        if lo == u32::MAX {
            let hi = self.hi.load(Ordering::Relaxed);
            self.hi.store(hi.wrapping_add(1), Ordering::Release);
        }
        self.lo.store(lo.wrapping_add(1), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_up() {
        let t = TickCount::new();
        assert_eq!(t.get(), 0);
        for _ in 0..1000 {
            t.increment();
        }
        assert_eq!(t.get(), 1000);
    }
}
