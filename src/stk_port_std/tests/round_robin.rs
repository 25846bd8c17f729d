//! Round-Robin fairness: three tasks take turns advancing a shared flag,
//! each sleeping between turns. Every task must get the same number of
//! activations.
use std::sync::atomic::{AtomicUsize, Ordering};

use stk_kernel::kernel::{Kernel, KernelMode};
use stk_kernel::strategy::SwitchStrategyRoundRobin;
use stk_kernel::task::{AccessMode, StaticTask, TaskStack};
use stk_kernel::{kernel_service, TICK_RESOLUTION_DEFAULT_US};
use stk_port_std::StdPort;

const ROUNDS: usize = 2;

static TURN: AtomicUsize = AtomicUsize::new(0);
static COUNTERS: [AtomicUsize; 3] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

fn take_turns(me: usize) {
    let svc = kernel_service();

    for _ in 0..ROUNDS {
        while TURN.load(Ordering::Relaxed) != me {
            svc.sleep(10);
        }
        COUNTERS[me].fetch_add(1, Ordering::Relaxed);
        TURN.store((me + 1) % 3, Ordering::Relaxed);
        svc.sleep(10);
    }
}

unsafe extern "C" fn task0(_: *mut ()) {
    take_turns(0)
}
unsafe extern "C" fn task1(_: *mut ()) {
    take_turns(1)
}
unsafe extern "C" fn task2(_: *mut ()) {
    take_turns(2)
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

static KERNEL: Kernel<StdPort, SwitchStrategyRoundRobin, 3> =
    Kernel::new(KernelMode::DYNAMIC, SwitchStrategyRoundRobin::new());

#[test]
fn round_robin_fairness() {
    let _ = env_logger::try_init();

    KERNEL.initialize();
    KERNEL.add_task(&TASK0);
    KERNEL.add_task(&TASK1);
    KERNEL.add_task(&TASK2);

    // returns when the last task exits
    KERNEL.start(TICK_RESOLUTION_DEFAULT_US);

    let counts: Vec<usize> = COUNTERS.iter().map(|c| c.load(Ordering::Relaxed)).collect();
    assert_eq!(counts, vec![ROUNDS, ROUNDS, ROUNDS]);
    assert_eq!(counts.iter().sum::<usize>(), 3 * ROUNDS);
}
