//! Mutex mutual exclusion: five tasks hammer a shared (non-atomic)
//! counter under a mutex, with an occasional busy delay inside the
//! critical region to force contention across preemptions.
use std::sync::atomic::{AtomicUsize, Ordering};

use stk_kernel::kernel::{Kernel, KernelMode};
use stk_kernel::strategy::SwitchStrategyRoundRobin;
use stk_kernel::sync::Mutex;
use stk_kernel::task::{AccessMode, StaticTask, TaskStack};
use stk_kernel::{kernel_service, TICK_RESOLUTION_DEFAULT_US};
use stk_port_std::StdPort;

const TASKS: usize = 5;
const ITERATIONS: usize = 100;

static LOCK: Mutex = Mutex::new();
/// Deliberately a plain value behind the mutex, not an atomic: lost
/// updates would show up in the final sum.
static mut SHARED: usize = 0;
static DONE: AtomicUsize = AtomicUsize::new(0);

fn grind(me: usize) {
    let svc = kernel_service();

    for i in 0..ITERATIONS {
        LOCK.lock();
        // Safety: `SHARED` is only touched while `LOCK` is held
        let v = unsafe { SHARED };
        if i % 4 == 3 {
            svc.delay(1);
        }
        unsafe { SHARED = v + 1 };
        LOCK.unlock();

        if i % 8 == me {
            svc.switch_to_next();
        }
    }

    DONE.fetch_add(1, Ordering::Relaxed);
}

unsafe extern "C" fn task0(_: *mut ()) {
    grind(0)
}
unsafe extern "C" fn task1(_: *mut ()) {
    grind(1)
}
unsafe extern "C" fn task2(_: *mut ()) {
    grind(2)
}
unsafe extern "C" fn task3(_: *mut ()) {
    grind(3)
}
unsafe extern "C" fn task4(_: *mut ()) {
    grind(4)
}

static STACK0: TaskStack<256> = TaskStack::new();
static STACK1: TaskStack<256> = TaskStack::new();
static STACK2: TaskStack<256> = TaskStack::new();
static STACK3: TaskStack<256> = TaskStack::new();
static STACK4: TaskStack<256> = TaskStack::new();

static TASK0: StaticTask =
    StaticTask::new(task0, core::ptr::null_mut(), &STACK0, AccessMode::Privileged);
static TASK1: StaticTask =
    StaticTask::new(task1, core::ptr::null_mut(), &STACK1, AccessMode::Privileged);
static TASK2: StaticTask =
    StaticTask::new(task2, core::ptr::null_mut(), &STACK2, AccessMode::Privileged);
static TASK3: StaticTask =
    StaticTask::new(task3, core::ptr::null_mut(), &STACK3, AccessMode::Privileged);
static TASK4: StaticTask =
    StaticTask::new(task4, core::ptr::null_mut(), &STACK4, AccessMode::Privileged);

static KERNEL: Kernel<StdPort, SwitchStrategyRoundRobin, TASKS> =
    Kernel::new(KernelMode::DYNAMIC.union(KernelMode::SYNC), SwitchStrategyRoundRobin::new());

#[test]
fn mutex_mutual_exclusion() {
    let _ = env_logger::try_init();

    KERNEL.initialize();
    KERNEL.add_task(&TASK0);
    KERNEL.add_task(&TASK1);
    KERNEL.add_task(&TASK2);
    KERNEL.add_task(&TASK3);
    KERNEL.add_task(&TASK4);

    KERNEL.start(TICK_RESOLUTION_DEFAULT_US);

    assert_eq!(DONE.load(Ordering::Relaxed), TASKS);
    assert_eq!(unsafe { SHARED }, TASKS * ITERATIONS);
}
