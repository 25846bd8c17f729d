//! SuperTinyKernel: a deterministic, preemptive, lightweight real-time
//! scheduling kernel for bare-metal targets.
//!
//! The kernel multiplexes a fixed or dynamic set of application tasks onto
//! one CPU core, with deterministic context switching, sleep/wake, both
//! soft and hard real-time scheduling, and a set of synchronization
//! primitives built on a single `start_waiting` building block.
//!
//! # Structure
//!
//! * [`kernel::Kernel`] — the task table and the scheduler state machine.
//! * [`port::Port`] — the platform abstraction implemented by the port
//!   crates (`stk_port_arm_m`, `stk_port_riscv`, `stk_port_std`).
//! * [`strategy`] — the switching strategies (Round-Robin, SWRR,
//!   Fixed-Priority, RM/DM with WCRT analysis, EDF).
//! * [`service`] — the run-time façade task code talks to.
//! * [`sync`] — Mutex, SpinLock, Semaphore, Event, ConditionVariable,
//!   RWMutex, and the bounded Pipe.
//!
//! # Usage
//!
//! ```no_run
//! # use stk_kernel::{kernel::{Kernel, KernelMode}, strategy::SwitchStrategyRoundRobin};
//! # use stk_kernel::task::{AccessMode, StaticTask, TaskStack};
//! # type Port = stk_kernel::doctest_port::NullPort;
//! unsafe extern "C" fn blink(_arg: *mut ()) { /* ... */ }
//!
//! static STACK1: TaskStack<256> = TaskStack::new();
//! static TASK1: StaticTask =
//!     StaticTask::new(blink, core::ptr::null_mut(), &STACK1, AccessMode::User);
//!
//! static KERNEL: Kernel<Port, SwitchStrategyRoundRobin, 3> =
//!     Kernel::new(KernelMode::STATIC, SwitchStrategyRoundRobin::new());
//!
//! KERNEL.initialize();
//! KERNEL.add_task(&TASK1);
//! KERNEL.start(1000); // 1 ms tick
//! ```
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod kernel;
pub mod klock;
pub mod port;
pub mod service;
pub mod strategy;
pub mod sync;
pub mod task;
pub mod utils;

pub use kernel::{Kernel, KernelMode};
pub use port::{Port, PortEvents, StackKind};
pub use service::{instance as kernel_service, KernelService};
pub use task::{AccessMode, StaticTask, Task, TaskStack, Tid};

/// Timeout of a blocking operation, in ticks.
pub type Timeout = i32;

/// [`Timeout`]: do not block; fail immediately when the fast path does not
/// succeed.
pub const NO_WAIT: Timeout = 0;

/// [`Timeout`]: block until the wait condition is satisfied, however long
/// that takes.
pub const WAIT_INFINITE: Timeout = -1;

/// Default tick resolution passed to [`Kernel::start`]: 1 millisecond.
pub const TICK_RESOLUTION_DEFAULT_US: u32 = 1000;

/// Minimum stack size of the kernel's trap stacks, in machine words.
pub const STACK_SIZE_MIN: usize = 32;

/// A do-nothing [`Port`] so that the crate-level example compiles. Not a
/// real platform.
#[doc(hidden)]
pub mod doctest_port {
    use crate::port::{Port, PortEvents, StackKind};
    use crate::task::{AccessMode, Stack, StackRegion, Task};

    pub struct NullPort;

    unsafe impl Port for NullPort {
        fn start(_: &'static dyn PortEvents, _: u32, _: Option<&'static Stack>) {}
        fn stop() {}
        fn init_stack(_: StackKind, _: &Stack, _: StackRegion, _: Option<&'static dyn Task>) -> bool {
            true
        }
        fn switch_context(_: Option<&'static Stack>, _: &'static Stack) {}
        fn set_access_mode(_: AccessMode) {}
        fn tick_resolution_us() -> i32 {
            1000
        }
        fn caller_sp() -> usize {
            0
        }
        unsafe fn enter_cpu_lock() {}
        unsafe fn leave_cpu_lock() {}
        fn is_cpu_lock_active() -> bool {
            false
        }
        fn is_interrupt_context() -> bool {
            false
        }
        fn relax_cpu() {}
        fn hard_fault() -> ! {
            panic!("hard fault");
        }
    }
}
