//! Simulation environment for running STK on a hosted target.
//!
//! Each task slot is backed by an OS thread; exactly one of them is
//! allowed to run at any moment, enforced with a *remote park* operation
//! (Unix: a `SIGUSR1`-driven park, Windows: `SuspendThread`). A timer
//! thread plays the role of the tick interrupt: it invokes the kernel's
//! tick handler once per tick period, and the handler's context-switch
//! requests park the outgoing task's thread and unpark the incoming one.
//!
//! The simulated critical section is a spin flag: while any thread holds
//! it the timer thread cannot enter the tick handler, which is exactly the
//! "tick interrupt is masked" behavior of the hardware ports.
//!
//! Timer resolution is clamped to 10 ms on Windows (the Win32 timers are
//! too jittery below that) and to 1 ms elsewhere.
//!
//! # Caveats
//!
//! * One kernel per process. `Port::start` can be called again only after
//!   a dynamic kernel fully stopped.
//! * Task threads of a stopped kernel stay parked until the process
//!   exits.
//! * A preempted ("remote-parked") thread may be holding a C runtime lock
//!   (e.g. inside `malloc`); task bodies that allocate or print while
//!   other tasks spin can therefore deadlock with the timer thread in
//!   pathological cases. Kernel-only workloads are unaffected.
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use spin::Mutex as SpinMutex;
use stk_kernel::port::{Port, PortEvents, StackKind};
use stk_kernel::task::{AccessMode, Stack, StackRegion, Task, STACK_SENTINEL};

#[cfg(unix)]
#[path = "threading_unix.rs"]
mod threading;
#[cfg(windows)]
#[path = "threading_windows.rs"]
mod threading;

/// Minimum tick resolution of the host timer, in microseconds.
#[cfg(windows)]
pub const MIN_TICK_RESOLUTION_US: u32 = 10_000;
#[cfg(not(windows))]
pub const MIN_TICK_RESOLUTION_US: u32 = 1_000;

/// The role of the current thread within the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    /// The thread that called `Port::start` (or an unrelated one).
    Unknown,
    /// The backing thread of a task.
    Task,
    /// The timer thread, standing in for the tick ISR.
    Interrupt,
}

std::thread_local! {
    static THREAD_ROLE: std::cell::Cell<ThreadRole> =
        const { std::cell::Cell::new(ThreadRole::Unknown) };
    /// An address inside the current task's (nominal) stack buffer, so
    /// the kernel can map this thread back to its task slot.
    static CALLER_SP: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// One task or trap slot. `Stack::sp` holds `index + 1` of the slot.
struct Slot {
    kind: StackKind,
    thread: Option<threading::Thread>,
}

struct DoneFlag {
    flag: Mutex<bool>,
    cond: Condvar,
}

/// The internal state of the port.
struct State {
    slots: SpinMutex<Vec<Slot>>,
    events: OnceCell<&'static dyn PortEvents>,
    /// The simulated interrupt mask.
    cpu_lock: AtomicBool,
    tick_us: AtomicI32,
    stop_requested: AtomicBool,
    done: DoneFlag,
    /// Remote parks applied by the tick handler, for diagnostics.
    preemption_count: AtomicUsize,
}

static STATE: State = State {
    slots: SpinMutex::new(Vec::new()),
    events: OnceCell::new(),
    cpu_lock: AtomicBool::new(false),
    tick_us: AtomicI32::new(MIN_TICK_RESOLUTION_US as i32),
    stop_requested: AtomicBool::new(false),
    done: DoneFlag {
        flag: Mutex::new(false),
        cond: Condvar::new(),
    },
    preemption_count: AtomicUsize::new(0),
};

/// Number of preemptions (remote parks) performed so far. Test
/// diagnostics.
pub fn preemption_count() -> usize {
    STATE.preemption_count.load(Ordering::Relaxed)
}

/// `*mut ()` that can cross a thread boundary.
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}

fn slot_thread(stack: &Stack) -> Option<threading::Thread> {
    let id = stack.sp();
    assert!(id != 0, "stack descriptor was never initialized");
    let slots = STATE.slots.lock();
    slots[id - 1].thread.clone()
}

fn events() -> &'static dyn PortEvents {
    *STATE.events.get().expect("scheduling was not started")
}

/// The hosted platform driver.
pub struct StdPort;

unsafe impl Port for StdPort {
    fn start(events: &'static dyn PortEvents, tick_us: u32, _exit_trap: Option<&'static Stack>) {
        let tick_us = tick_us.max(MIN_TICK_RESOLUTION_US);
        STATE.tick_us.store(tick_us as i32, Ordering::Relaxed);
        STATE.stop_requested.store(false, Ordering::Relaxed);
        *STATE.done.flag.lock().unwrap() = false;
        // on a subsequent `start` of the same kernel the handler is
        // necessarily the same object, so a failed `set` is fine
        let _ = STATE.events.set(events);

        log::trace!("start: tick resolution {tick_us} us");

        // ask the kernel for the initial context and make it runnable
        let active = self::events().on_start();
        if let Some(thread) = slot_thread(active) {
            thread.unpark();
        }

        // the timer thread stands in for the tick interrupt
        let timer = std::thread::spawn(move || {
            THREAD_ROLE.with(|r| r.set(ThreadRole::Interrupt));

            let period = Duration::from_micros(tick_us as u64);
            let mut next = Instant::now() + period;
            while !STATE.stop_requested.load(Ordering::Acquire) {
                let now = Instant::now();
                if next > now {
                    std::thread::sleep(next - now);
                } else {
                    // fell behind (a long critical section); don't burst
                    next = now;
                }
                next += period;

                if STATE.stop_requested.load(Ordering::Acquire) {
                    break;
                }
                self::events().on_tick();
            }
            log::trace!("timer thread stopping");
        });

        // block until the kernel decides scheduling is over
        {
            let mut done = STATE.done.flag.lock().unwrap();
            while !*done {
                done = STATE.done.cond.wait(done).unwrap();
            }
        }

        timer.join().unwrap();
        log::trace!("start: returned through the exit trap");
    }

    fn stop() {
        log::trace!("stop");
        STATE.stop_requested.store(true, Ordering::Release);

        let mut done = STATE.done.flag.lock().unwrap();
        *done = true;
        STATE.done.cond.notify_all();
    }

    fn init_stack(
        kind: StackKind,
        stack: &Stack,
        memory: StackRegion,
        task: Option<&'static dyn Task>,
    ) -> bool {
        if memory.is_empty() {
            return false;
        }

        // keep the stack-overflow sentinel protocol observable even
        // though the buffer never backs a real context
        for i in 0..memory.len() {
            unsafe { memory.as_ptr().add(i).write(STACK_SENTINEL) };
        }

        let thread = match kind {
            StackKind::UserTask => {
                let task = task.expect("user-task stack without a task");
                let entry = task.entry_fn();
                let data = SendPtr(task.user_data());
                let sp_addr = memory.as_ptr() as usize + core::mem::size_of::<usize>();
                // the kernel's stack descriptors live in a static kernel
                // instance and outlive every task thread
                let stack_ptr = SendPtr(stack as *const Stack as *mut Stack);

                Some(threading::spawn(move || {
                    let data = data;
                    let stack_ptr = stack_ptr;
                    THREAD_ROLE.with(|r| r.set(ThreadRole::Task));
                    CALLER_SP.with(|c| c.set(sp_addr));

                    // wait for the first dispatch
                    threading::park();

                    log::trace!("task thread running (sp {sp_addr:#x})");
                    // Safety: the port is the one who runs task entry
                    // points
                    unsafe { entry(data.0) };

                    // the task returned from its entry function
                    self::events().on_task_exit(unsafe { &*stack_ptr.0 });
                    loop {
                        threading::park();
                    }
                }))
            }
            StackKind::SleepTrap | StackKind::ExitTrap => {
                // the traps need no backing thread: "executing the sleep
                // trap" is simply no task thread being unparked
                None
            }
        };

        let mut slots = STATE.slots.lock();
        slots.push(Slot { kind, thread });
        stack.set_sp(slots.len());
        log::trace!("slot {} = {:?}", slots.len() - 1, kind);

        true
    }

    fn switch_context(idle: Option<&'static Stack>, active: &'static Stack) {
        // park first, unpark second: with a single simulated core there is
        // never a moment with two running tasks
        if let Some(idle) = idle {
            if let Some(thread) = slot_thread(idle) {
                STATE.preemption_count.fetch_add(1, Ordering::Relaxed);
                thread.park_remote();
            }
        }
        if let Some(thread) = slot_thread(active) {
            thread.unpark();
        }
    }

    fn set_access_mode(_mode: AccessMode) {
        // the host has no concept of the task privilege toggle
    }

    fn tick_resolution_us() -> i32 {
        STATE.tick_us.load(Ordering::Relaxed)
    }

    fn caller_sp() -> usize {
        let sp = CALLER_SP.with(|c| c.get());
        assert!(sp != 0, "caller_sp outside a task thread");
        sp
    }

    unsafe fn enter_cpu_lock() {
        while STATE
            .cpu_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
    }

    unsafe fn leave_cpu_lock() {
        STATE.cpu_lock.store(false, Ordering::Release);
    }

    fn is_cpu_lock_active() -> bool {
        STATE.cpu_lock.load(Ordering::Relaxed)
    }

    fn is_interrupt_context() -> bool {
        THREAD_ROLE.with(|r| r.get()) == ThreadRole::Interrupt
    }

    fn relax_cpu() {
        std::thread::yield_now();
    }

    fn hard_fault() -> ! {
        panic!("hard fault");
    }
}
