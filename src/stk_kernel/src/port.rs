//! The interface between the kernel and a platform driver.
//!
//! A platform owns the hardware: the periodic tick source, the context
//! save/restore machinery, the CPU privilege toggle, and the traps used
//! when there is nothing to run (sleep) or nothing left at all (exit).
//! The kernel drives it exclusively through [`Port`]; the platform calls
//! back into the kernel through [`PortEvents`].
use crate::task::{AccessMode, Stack, StackRegion, Task};

/// What a stack buffer is initialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    /// A user task: the initial frame lands in the task's entry function
    /// with the user argument in the first argument register and the
    /// return address pointing at the platform's task-exit trampoline.
    UserTask,
    /// The kernel's sleep trap: a platform-internal WFI/WFE loop.
    SleepTrap,
    /// The kernel's exit trap: returns control to the caller of
    /// [`Port::start`].
    ExitTrap,
}

/// Kernel-side handler for platform events.
///
/// Implemented by the kernel; a platform receives it in [`Port::start`]
/// and invokes it from its ISRs and trampolines.
pub trait PortEvents: Sync {
    /// Scheduling is about to start. Returns the stack to branch into
    /// first (a task's stack, or the sleep trap when every task has a
    /// start delay).
    fn on_start(&'static self) -> &'static Stack;

    /// The periodic tick fired. Invoked from the tick ISR.
    fn on_tick(&'static self);

    /// A task requested an immediate switch (yield). Invoked from task
    /// context; returns once the task is runnable again.
    fn on_task_switch(&'static self, caller_sp: usize);

    /// A task requested to sleep for `sleep_ticks` ticks. Invoked from
    /// task context; returns once the task is runnable again.
    fn on_task_sleep(&'static self, caller_sp: usize, sleep_ticks: u32);

    /// A task returned from its entry function. Invoked from the
    /// platform's task-exit trampoline.
    fn on_task_exit(&'static self, stack: &Stack);
}

/// A platform driver.
///
/// Implemented on a zero-sized type by each port crate. All operations are
/// associated functions so that ISRs can reach the platform state without
/// an instance.
///
/// # Safety
///
/// The implementation must uphold the contracts documented on each method;
/// the kernel builds its memory-safety argument on them (in particular the
/// CPU Lock primitives and the context-switch protocol).
pub unsafe trait Port: 'static {
    /// Start scheduling: program the tick source for `tick_us`
    /// microseconds per tick with the tick and context-switch interrupts
    /// at the lowest priority, anchor the exit trap, obtain the first
    /// stack via [`PortEvents::on_start`], and branch into it.
    ///
    /// Returns only after [`Port::stop`] ran (through the exit-trap
    /// anchor), which happens exactly when the last dynamic task exits.
    fn start(events: &'static dyn PortEvents, tick_us: u32, exit_trap: Option<&'static Stack>);

    /// Halt the tick source, clear any pending context switch, and arrange
    /// for control to return from [`Port::start`].
    fn stop();

    /// Write an ABI-correct initial context into `memory` and store the
    /// resulting stack pointer into `stack`. Returns `false` if the buffer
    /// cannot hold the architecture's register save area.
    ///
    /// The rest of the buffer is filled with [`crate::task::STACK_SENTINEL`].
    fn init_stack(
        kind: StackKind,
        stack: &Stack,
        memory: StackRegion,
        task: Option<&'static dyn Task>,
    ) -> bool;

    /// Request a context switch: save the outgoing context through `idle`
    /// (`None` when the outgoing context is to be discarded) and make
    /// `active` the running context. The switch may be deferred to the
    /// next interrupt-return boundary. Callable from interrupt and task
    /// context.
    fn switch_context(idle: Option<&'static Stack>, active: &'static Stack);

    /// Toggle the processor privilege of Thread mode. A no-op on
    /// architectures without a user/privileged split.
    fn set_access_mode(mode: AccessMode);

    /// The configured number of microseconds per tick.
    fn tick_resolution_us() -> i32;

    /// The stack pointer of the immediate caller, used by the kernel to
    /// map a yielding task back to its slot.
    fn caller_sp() -> usize;

    /// Mask the tick and context-switch interrupts.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, paired with
    /// [`Port::leave_cpu_lock`].
    unsafe fn enter_cpu_lock();

    /// Unmask the interrupts masked by [`Port::enter_cpu_lock`].
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel while CPU Lock is active.
    unsafe fn leave_cpu_lock();

    /// Whether CPU Lock is currently active.
    fn is_cpu_lock_active() -> bool;

    /// Whether the current context is an interrupt handler.
    fn is_interrupt_context() -> bool;

    /// Spin-wait hint (`pause`/`yield` instruction).
    fn relax_cpu();

    /// Raise a fatal fault. Used for HRT deadline misses.
    fn hard_fault() -> !;
}
