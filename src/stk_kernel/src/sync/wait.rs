//! Waiter records and wait lists.
//!
//! A *waiter record* ([`WaitObject`]) describes one pending blocking
//! operation: which task is blocked on what sync object, how long it may
//! remain blocked, and whether it was released by a wake or by the
//! timeout. Records live on the blocked task's stack for the duration of
//! the blocking call and are linked into two lists at once:
//!
//! * the owning sync object's FIFO [`WaitQueue`], which wake operations
//!   pop from the front, and
//! * the kernel's global [`WaitChain`], which the tick handler walks to
//!   decrement the outstanding timeouts.
//!
//! A record is fully unlinked by whoever releases it (waker or tick
//! handler) before the blocked task resumes, so the record never outlives
//! its stack frame while reachable.
//!
//! Every field and link in here is guarded by the system-wide critical
//! section; the list operations must only be invoked with CPU Lock held.
//! (Plain `Cell`s are used rather than lock-token cells because the chain
//! is woven through the kernel state, whose borrow already witnesses the
//! lock.)
use core::{cell::Cell, fmt, ptr::NonNull};

use crate::klock::CpuLockTokenRefMut;
use crate::task::Tid;
use crate::utils::{intrusive_list::Idx, Init};
use crate::Timeout;

/// A reference to a [`WaitObject`].
#[derive(Clone, Copy)]
pub(crate) struct WaitRef(pub(crate) NonNull<WaitObject>);

// Safety: `WaitObject` is only accessed under CPU Lock.
unsafe impl Send for WaitRef {}
unsafe impl Sync for WaitRef {}

impl PartialEq for WaitRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for WaitRef {}

impl fmt::Debug for WaitRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitRef").field(&self.0).finish()
    }
}

impl WaitRef {
    /// # Safety
    ///
    /// The pointee must be extant. This holds for every record reachable
    /// through a wait queue or the wait chain.
    #[inline]
    pub(crate) unsafe fn as_ref<'a>(self) -> &'a WaitObject {
        unsafe { &*self.0.as_ptr() }
    }
}

/// Links to the neighbor records within one of the two lists.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WaitLink {
    prev: Option<WaitRef>,
    next: Option<WaitRef>,
}

/// A waiter record. Constructed by `start_waiting` on the waiting task's
/// stack; only survives until the blocking call returns.
pub struct WaitObject {
    /// Task-table index of the blocked task.
    pub(crate) task: Idx,
    /// Task id of the blocked task.
    pub(crate) tid: Tid,
    /// The sync object this record is queued on.
    ///
    /// The pointee outlives the record: the blocked task sits inside one
    /// of the object's methods, and sync objects assert their wait queue
    /// is empty on destruction.
    pub(crate) sync_obj: NonNull<dyn SyncObject>,
    /// Remaining timeout in ticks; negative means "infinite".
    pub(crate) timeout: Cell<Timeout>,
    /// Set when the wait expired instead of being woken.
    pub(crate) is_timeout: Cell<bool>,
    /// Membership in the sync object's FIFO wait queue.
    pub(crate) link_queue: Cell<Option<WaitLink>>,
    /// Membership in the kernel's global timeout chain.
    pub(crate) link_chain: Cell<Option<WaitLink>>,
}

impl WaitObject {
    pub(crate) fn new(task: Idx, tid: Tid, sync_obj: &dyn SyncObject, timeout: Timeout) -> Self {
        Self {
            task,
            tid,
            // Safety: the pointee outlives the record, per the invariant
            // documented on `sync_obj` above; erasing the lifetime here is
            // sound because nothing ever dereferences it past that point.
            sync_obj: NonNull::from(unsafe {
                core::mem::transmute::<&dyn SyncObject, &'static dyn SyncObject>(sync_obj)
            }),
            timeout: Cell::new(timeout),
            is_timeout: Cell::new(false),
            link_queue: Cell::new(None),
            link_chain: Cell::new(None),
        }
    }

    /// Task id of the blocked task.
    #[inline]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Whether the wait was released by the timeout rather than a wake.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        self.is_timeout.get()
    }

    /// Successor in the global timeout chain.
    #[inline]
    pub(crate) fn chain_next(&self) -> Option<WaitRef> {
        self.link_chain.get().and_then(|l| l.next)
    }
}

/// Which of a record's two link words a list operates on.
#[derive(Clone, Copy, PartialEq, Eq)]
enum LinkSel {
    Queue,
    Chain,
}

#[inline]
fn link_cell(w: &WaitObject, sel: LinkSel) -> &Cell<Option<WaitLink>> {
    match sel {
        LinkSel::Queue => &w.link_queue,
        LinkSel::Chain => &w.link_chain,
    }
}

/// First/last pointers of a waiter list. CPU Lock guards every access.
struct ListEnds {
    first: Cell<Option<WaitRef>>,
    last: Cell<Option<WaitRef>>,
    len: Cell<usize>,
}

impl Init for ListEnds {
    const INIT: Self = Self {
        first: Cell::new(None),
        last: Cell::new(None),
        len: Cell::new(0),
    };
}

impl ListEnds {
    fn push_back(&self, wref: WaitRef, sel: LinkSel) {
        // Safety: linked records are extant
        let w = unsafe { wref.as_ref() };
        debug_assert!(link_cell(w, sel).get().is_none(), "record is already linked");

        let old_last = self.last.get();
        link_cell(w, sel).set(Some(WaitLink {
            prev: old_last,
            next: None,
        }));
        if let Some(last) = old_last {
            // Safety: ditto
            let lw = unsafe { last.as_ref() };
            let mut l = link_cell(lw, sel).get().unwrap();
            l.next = Some(wref);
            link_cell(lw, sel).set(Some(l));
        } else {
            self.first.set(Some(wref));
        }
        self.last.set(Some(wref));
        self.len.set(self.len.get() + 1);
    }

    fn unlink(&self, wref: WaitRef, sel: LinkSel) {
        // Safety: linked records are extant
        let w = unsafe { wref.as_ref() };
        let link = link_cell(w, sel).get().expect("record is not linked");

        if let Some(prev) = link.prev {
            let pw = unsafe { prev.as_ref() };
            let mut l = link_cell(pw, sel).get().unwrap();
            l.next = link.next;
            link_cell(pw, sel).set(Some(l));
        } else {
            self.first.set(link.next);
        }
        if let Some(next) = link.next {
            let nw = unsafe { next.as_ref() };
            let mut l = link_cell(nw, sel).get().unwrap();
            l.prev = link.prev;
            link_cell(nw, sel).set(Some(l));
        } else {
            self.last.set(link.prev);
        }

        link_cell(w, sel).set(None);
        self.len.set(self.len.get() - 1);
    }
}

/// FIFO list of waiter records queued on one sync object.
pub struct WaitQueue {
    ends: ListEnds,
}

// Safety: only accessed under CPU Lock.
unsafe impl Sync for WaitQueue {}

impl Init for WaitQueue {
    const INIT: Self = Self {
        ends: ListEnds::INIT,
    };
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn is_empty(&self) -> bool {
        self.ends.len.get() == 0
    }

    pub fn len(&self) -> usize {
        self.ends.len.get()
    }

    pub(crate) fn first(&self) -> Option<WaitRef> {
        self.ends.first.get()
    }

    pub(crate) fn push_back(&self, wref: WaitRef) {
        self.ends.push_back(wref, LinkSel::Queue);
    }

    pub(crate) fn unlink(&self, wref: WaitRef) {
        self.ends.unlink(wref, LinkSel::Queue);
    }

    pub(crate) fn pop_front(&self) -> Option<WaitRef> {
        let first = self.ends.first.get()?;
        self.unlink(first);
        Some(first)
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        // An outstanding waiter at destruction is a programming error
        // (dangling waiters).
        assert!(
            self.is_empty(),
            "sync object destroyed with tasks still waiting on it"
        );
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel's chain of every outstanding waiter record, walked once per
/// tick to decrement the timeouts.
pub(crate) struct WaitChain {
    ends: ListEnds,
}

impl Init for WaitChain {
    const INIT: Self = Self {
        ends: ListEnds::INIT,
    };
}

impl WaitChain {
    pub(crate) fn push_back(&self, wref: WaitRef) {
        self.ends.push_back(wref, LinkSel::Chain);
    }

    pub(crate) fn unlink(&self, wref: WaitRef) {
        self.ends.unlink(wref, LinkSel::Chain);
    }

    pub(crate) fn first(&self) -> Option<WaitRef> {
        self.ends.first.get()
    }

    pub(crate) fn len(&self) -> usize {
        self.ends.len.get()
    }
}

/// A waitable synchronization object: anything carrying a FIFO wait queue
/// that `start_waiting` can park tasks on.
pub trait SyncObject: Sync {
    /// The object's wait queue.
    fn wait_queue(&self) -> &WaitQueue;

    /// Invoked right after `waiter` was removed from the wait queue,
    /// before the waiting task is resumed. Auto-reset events consume
    /// their signaled state here.
    fn on_waiter_removed(&self, lock: CpuLockTokenRefMut<'_>, waiter: &WaitObject) {
        let _ = (lock, waiter);
    }
}

/// Outcome of a completed wait, as reported by `start_waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    /// The wait expired instead of being woken.
    pub timed_out: bool,
}
