//! SpinLock mutual exclusion plus the per-task TLS slot: each task parks
//! a pointer to its own scratch area in the TLS slot and must read the
//! same pointer back after arbitrary preemption.
use std::sync::atomic::{AtomicUsize, Ordering};

use stk_kernel::kernel::{Kernel, KernelMode};
use stk_kernel::strategy::SwitchStrategyRoundRobin;
use stk_kernel::sync::SpinLock;
use stk_kernel::task::{AccessMode, StaticTask, TaskStack};
use stk_kernel::{kernel_service, TICK_RESOLUTION_DEFAULT_US};
use stk_port_std::StdPort;

const TASKS: usize = 3;
const ITERATIONS: usize = 200;

static LOCK: SpinLock = SpinLock::with_spin_count(16);
static mut SHARED: usize = 0;
static TLS_MISMATCHES: AtomicUsize = AtomicUsize::new(0);
static SCRATCH: [AtomicUsize; TASKS] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

fn grind(me: usize) {
    let svc = kernel_service();

    let my_scratch = &SCRATCH[me] as *const AtomicUsize as *mut ();
    svc.set_tls_ptr(my_scratch);

    for i in 0..ITERATIONS {
        LOCK.lock();
        // recursive acquisition must be free of charge
        assert!(LOCK.try_lock());
        let v = unsafe { SHARED };
        unsafe { SHARED = v + 1 };
        LOCK.unlock();
        LOCK.unlock();

        if i % 16 == me {
            svc.sleep(1);
        }

        // the TLS slot follows the task across preemptions
        if svc.tls_ptr() != my_scratch {
            TLS_MISMATCHES.fetch_add(1, Ordering::Relaxed);
        }
    }

    SCRATCH[me].store(svc.current_tid(), Ordering::Relaxed);
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

static STACK0: TaskStack<256> = TaskStack::new();
static STACK1: TaskStack<256> = TaskStack::new();
static STACK2: TaskStack<256> = TaskStack::new();

static TASK0: StaticTask =
    StaticTask::new(task0, core::ptr::null_mut(), &STACK0, AccessMode::Privileged);
static TASK1: StaticTask =
    StaticTask::new(task1, core::ptr::null_mut(), &STACK1, AccessMode::Privileged);
static TASK2: StaticTask =
    StaticTask::new(task2, core::ptr::null_mut(), &STACK2, AccessMode::Privileged);

static KERNEL: Kernel<StdPort, SwitchStrategyRoundRobin, TASKS> =
    Kernel::new(KernelMode::DYNAMIC.union(KernelMode::SYNC), SwitchStrategyRoundRobin::new());

#[test]
fn spinlock_and_tls() {
    let _ = env_logger::try_init();

    KERNEL.initialize();
    KERNEL.add_task(&TASK0);
    KERNEL.add_task(&TASK1);
    KERNEL.add_task(&TASK2);

    KERNEL.start(TICK_RESOLUTION_DEFAULT_US);

    assert_eq!(unsafe { SHARED }, TASKS * ITERATIONS);
    assert_eq!(TLS_MISMATCHES.load(Ordering::Relaxed), 0);

    // task ids are the slot numbers, starting at 1
    let mut tids: Vec<usize> = SCRATCH.iter().map(|s| s.load(Ordering::Relaxed)).collect();
    tids.sort_unstable();
    assert_eq!(tids, vec![1, 2, 3]);
}
