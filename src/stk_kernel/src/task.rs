//! Tasks and their kernel-side bookkeeping.
use core::cell::UnsafeCell;
use core::fmt;

use crate::utils::{intrusive_list::Link, Init};

/// Entry function of a task. Receives the opaque argument supplied by
/// [`Task::user_data`].
pub type TaskFn = unsafe extern "C" fn(*mut ());

/// Task identifier handed out by the kernel service. `0` means "no task"
/// (for example, an interrupt context).
pub type Tid = usize;

/// The pattern written to every word of a newly admitted task's stack.
/// The word at the bottom of the stack is checked on every context switch;
/// a mismatch means the stack was exhausted.
#[cfg(target_pointer_width = "64")]
pub const STACK_SENTINEL: usize = 0xdead_beef_dead_beef;
#[cfg(not(target_pointer_width = "64"))]
pub const STACK_SENTINEL: usize = 0xdead_beef;

/// CPU privilege level in which a task's Thread-mode code executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Unprivileged access mode (access to some hardware is restricted).
    User,
    /// Privileged access mode (hardware access is unrestricted).
    Privileged,
}

/// A caller-supplied stack region, expressed in machine words.
#[derive(Clone, Copy)]
pub struct StackRegion {
    ptr: *mut usize,
    len: usize,
}

// Safety: the region is only dereferenced by the kernel and the port while
// the owning task exists; `StackRegion` itself is just a fat pointer.
unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

impl StackRegion {
    /// # Safety
    ///
    /// `ptr..ptr + len` must be a writable region that stays valid for the
    /// lifetime of the task using it, aligned to 16 bytes.
    pub const unsafe fn new(ptr: *mut usize, len: usize) -> Self {
        Self { ptr, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut usize {
        self.ptr
    }

    /// Length in machine words.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `sp` points into this region (one-past-the-end included, as
    /// a descending stack starts there).
    #[inline]
    pub fn contains_sp(&self, sp: usize) -> bool {
        let start = self.ptr as usize;
        let end = start + self.len * core::mem::size_of::<usize>();
        sp >= start && sp <= end
    }

    /// The sentinel word at the bottom of the region.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads.
    pub(crate) unsafe fn bottom_word(&self) -> usize {
        unsafe { self.ptr.read_volatile() }
    }
}

impl fmt::Debug for StackRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StackRegion({:p}, {} words)", self.ptr, self.len)
    }
}

/// Statically-allocatable stack memory for a task, aligned as the
/// architectures require.
#[repr(C, align(16))]
pub struct TaskStack<const WORDS: usize> {
    mem: UnsafeCell<[usize; WORDS]>,
}

// Safety: accessed only by the owning task and the kernel under the rules
// of `StackRegion`.
unsafe impl<const WORDS: usize> Sync for TaskStack<WORDS> {}

impl<const WORDS: usize> TaskStack<WORDS> {
    pub const fn new() -> Self {
        Self {
            mem: UnsafeCell::new([0; WORDS]),
        }
    }

    pub const fn region(&self) -> StackRegion {
        StackRegion {
            ptr: self.mem.get() as *mut usize,
            len: WORDS,
        }
    }
}

/// A user task, as seen by the kernel.
///
/// The kernel never calls the entry function directly; the bound platform
/// builds an initial context that starts executing it when the task is
/// first switched in.
pub trait Task: Sync + 'static {
    /// The task's main entry function.
    fn entry_fn(&self) -> TaskFn;

    /// The opaque argument supplied to the entry function.
    fn user_data(&self) -> *mut ();

    /// The caller-supplied stack buffer.
    fn stack(&self) -> StackRegion;

    /// Hardware access mode of the task's Thread-mode code.
    fn access_mode(&self) -> AccessMode {
        AccessMode::Privileged
    }

    /// Scheduling weight (Smooth Weighted Round-Robin). `1..=0x7f_ffff`.
    fn weight(&self) -> i32 {
        1
    }

    /// Fixed priority (Fixed-Priority strategy). `0` is lowest, `31` is
    /// highest.
    fn priority(&self) -> u8 {
        0
    }

    /// Invoked (in HRT mode) when the task overran its deadline, right
    /// before the platform's hard fault is raised.
    fn on_deadline_missed(&self, duration_ticks: i32) {
        let _ = duration_ticks;
    }
}

/// Plain [`Task`] implementation: an entry function, an opaque argument,
/// and a reference to a [`TaskStack`].
pub struct StaticTask {
    entry: TaskFn,
    data: *mut (),
    stack: StackRegion,
    mode: AccessMode,
    weight: i32,
    priority: u8,
    on_deadline_missed: Option<fn(i32)>,
}

// Safety: the opaque argument is handed to exactly one task; sharing it
// beyond that is the application's contract, same as the underlying raw
// pointer type.
unsafe impl Send for StaticTask {}
unsafe impl Sync for StaticTask {}

impl StaticTask {
    pub const fn new<const WORDS: usize>(
        entry: TaskFn,
        data: *mut (),
        stack: &'static TaskStack<WORDS>,
        mode: AccessMode,
    ) -> Self {
        Self {
            entry,
            data,
            stack: stack.region(),
            mode,
            weight: 1,
            priority: 0,
            on_deadline_missed: None,
        }
    }

    /// Set the SWRR weight. `1..=0x7f_ffff`.
    pub const fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the fixed priority (`0..=31`).
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub const fn with_deadline_missed_hook(mut self, hook: fn(i32)) -> Self {
        self.on_deadline_missed = Some(hook);
        self
    }
}

impl Task for StaticTask {
    fn entry_fn(&self) -> TaskFn {
        self.entry
    }

    fn user_data(&self) -> *mut () {
        self.data
    }

    fn stack(&self) -> StackRegion {
        self.stack
    }

    fn access_mode(&self) -> AccessMode {
        self.mode
    }

    fn weight(&self) -> i32 {
        self.weight
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn on_deadline_missed(&self, duration_ticks: i32) {
        if let Some(hook) = self.on_deadline_missed {
            hook(duration_ticks);
        }
    }
}

/// One-word stack descriptor: the saved stack pointer of a task or trap.
///
/// The port's context-switch code stores and loads `sp` directly (possibly
/// from assembly), so the field is interior-mutable and the struct layout
/// is fixed.
#[repr(C)]
pub struct Stack {
    sp: UnsafeCell<usize>,
}

// Safety: `sp` is only accessed inside the context-switch path and under
// CPU Lock.
unsafe impl Sync for Stack {}

impl Init for Stack {
    const INIT: Self = Self {
        sp: UnsafeCell::new(0),
    };
}

impl Stack {
    pub const fn new() -> Self {
        Self::INIT
    }

    #[inline]
    pub fn sp(&self) -> usize {
        // Volatile: the port's assembly writes this word behind the
        // compiler's back.
        unsafe { self.sp.get().read_volatile() }
    }

    #[inline]
    pub fn set_sp(&self, sp: usize) {
        unsafe { self.sp.get().write_volatile(sp) }
    }

    /// Raw location of the saved stack pointer, for the port's assembly.
    #[inline]
    pub fn sp_ptr(&self) -> *mut usize {
        self.sp.get()
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Stack({:#x})", self.sp())
    }
}

bitflags::bitflags! {
    /// Kernel task state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TaskFlags: u32 {
        /// The task exited (or was removed) and will be unlinked on the
        /// next tick.
        const REMOVAL_PENDING = 1 << 0;
        /// The strategy has been notified that the task went to sleep
        /// (and not yet that it woke up). Strategies with a sleep
        /// sub-queue keep the task there while this is set.
        const SLEEP_NOTIFIED = 1 << 1;
    }
}

/// Hard Real-Time info of a bound task. Only meaningful when the kernel
/// runs in HRT mode.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HrtInfo {
    /// Scheduling periodicity (ticks).
    pub periodicity: i32,
    /// Work deadline (ticks).
    pub deadline: i32,
    /// Active time accumulated within the current period (ticks).
    pub duration: i32,
    /// Tick value recorded when the task was last switched in.
    pub last_ticks: i64,
}

impl Init for HrtInfo {
    const INIT: Self = Self {
        periodicity: 0,
        deadline: 0,
        duration: 0,
        last_ticks: 0,
    };
}

/// Kernel-owned per-task slot. A slot is *unbound* (free) until a user
/// task is admitted into it.
pub struct KernelTask {
    pub(crate) user: Option<&'static dyn Task>,
    pub(crate) flags: TaskFlags,
    /// Sleep counter in ticks. `0` = runnable; negative = asleep (or
    /// blocked) with `-time_sleep` ticks remaining.
    pub(crate) time_sleep: i32,
    pub(crate) hrt: HrtInfo,
    /// Membership in one of the strategy's queues.
    pub(crate) link: Option<Link>,
    /// SWRR dynamic weight.
    pub(crate) current_weight: i32,
    /// Per-task opaque TLS slot.
    pub(crate) tls: *mut (),
}

// Safety: mutated only under CPU Lock.
unsafe impl Send for KernelTask {}
unsafe impl Sync for KernelTask {}

impl Init for KernelTask {
    const INIT: Self = Self {
        user: None,
        flags: TaskFlags::empty(),
        time_sleep: 0,
        hrt: HrtInfo::INIT,
        link: None,
        current_weight: 0,
        tls: core::ptr::null_mut(),
    };
}

impl KernelTask {
    #[inline]
    pub(crate) fn is_busy(&self) -> bool {
        self.user.is_some()
    }

    #[inline]
    pub(crate) fn user(&self) -> &'static dyn Task {
        self.user.expect("slot is unbound")
    }

    /// Clear the bound values, freeing the slot.
    pub(crate) fn unbind(&mut self) {
        self.user = None;
        self.flags = TaskFlags::empty();
        self.time_sleep = 0;
        self.hrt = HrtInfo::INIT;
        self.current_weight = 0;
        self.tls = core::ptr::null_mut();
        debug_assert!(self.link.is_none());
    }

    /// Schedule the removal of the task from the kernel on the next tick.
    #[inline]
    pub(crate) fn schedule_removal(&mut self) {
        self.flags |= TaskFlags::REMOVAL_PENDING;
    }

    #[inline]
    pub(crate) fn is_pending_removal(&self) -> bool {
        self.flags.contains(TaskFlags::REMOVAL_PENDING)
    }

    /// Whether the task is asleep or blocked.
    #[inline]
    pub fn is_sleeping(&self) -> bool {
        self.time_sleep < 0
    }

    /// SWRR weight of the bound task.
    #[inline]
    pub fn weight(&self) -> i32 {
        self.user().weight()
    }

    /// Fixed priority of the bound task.
    #[inline]
    pub fn priority(&self) -> u8 {
        self.user().priority()
    }

    /// Link field accessor for strategy queues.
    #[inline]
    pub fn link_mut(&mut self) -> &mut Option<Link> {
        &mut self.link
    }

    #[inline]
    pub fn hrt_periodicity(&self) -> i32 {
        self.hrt.periodicity
    }

    #[inline]
    pub fn hrt_deadline(&self) -> i32 {
        self.hrt.deadline
    }

    /// Deadline of the current period relative to `now` (EDF key).
    pub fn hrt_relative_deadline(&self, now: i64) -> i32 {
        let since_switch_in = (now - self.hrt.last_ticks).max(0) as i32;
        self.hrt.deadline - self.hrt.duration - since_switch_in
    }

    /// Whether `sp` points into this task's stack buffer.
    pub(crate) fn is_memory_of_sp(&self, sp: usize) -> bool {
        self.user.is_some_and(|u| u.stack().contains_sp(sp))
    }

    /// Initialize the slot with HRT parameters. A positive start delay
    /// puts the task to sleep until its first release.
    pub(crate) fn hrt_init(&mut self, periodicity_tc: u32, deadline_tc: u32, start_delay_tc: u32) {
        self.hrt.periodicity = periodicity_tc as i32;
        self.hrt.deadline = deadline_tc as i32;
        self.time_sleep = -(start_delay_tc as i32);
    }

    /// Called when the task is switched into the scheduling process.
    pub(crate) fn hrt_on_switched_in(&mut self, ticks: i64) {
        self.hrt.last_ticks = ticks;
    }

    /// Called when the task informed the kernel that its work for the
    /// current period is complete.
    pub(crate) fn hrt_on_work_completed(&mut self) {
        self.time_sleep = i32::MIN;
    }
}

impl fmt::Debug for KernelTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KernelTask")
            .field("busy", &self.is_busy())
            .field("flags", &self.flags)
            .field("time_sleep", &self.time_sleep)
            .field("hrt", &self.hrt)
            .field("link", &self.link)
            .finish()
    }
}

/// The kernel's task table, indexed by the strategies through arena
/// indices.
pub type TaskTable = [KernelTask];
