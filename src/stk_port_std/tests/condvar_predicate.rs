//! Condition-variable predicate loop: a producer raises a per-consumer
//! predicate and notifies; each consumer loops on its predicate in the
//! classic `while (!pred) cv.wait(mutex)` shape.
use std::sync::atomic::{AtomicUsize, Ordering};

use stk_kernel::kernel::{Kernel, KernelMode};
use stk_kernel::strategy::SwitchStrategyRoundRobin;
use stk_kernel::sync::{ConditionVariable, Mutex};
use stk_kernel::task::{AccessMode, StaticTask, TaskStack};
use stk_kernel::{kernel_service, TICK_RESOLUTION_DEFAULT_US};
use stk_port_std::StdPort;

const CONSUMERS: usize = 3;

static LOCK: Mutex = Mutex::new();
static COND: ConditionVariable = ConditionVariable::new();
/// Bitmask of consumers whose predicate holds; guarded by `LOCK`.
static READY_MASK: AtomicUsize = AtomicUsize::new(0);
static SERVED: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn producer(_: *mut ()) {
    let svc = kernel_service();

    // let the consumers reach their waits
    svc.sleep(20);

    for me in 0..CONSUMERS {
        LOCK.lock();
        READY_MASK.fetch_or(1 << me, Ordering::Relaxed);
        LOCK.unlock();

        // a single notify may wake a consumer whose predicate is still
        // down; the predicate loop absorbs that
        COND.notify_all();
        svc.sleep(10);
    }
}

fn consume(me: usize) {
    LOCK.lock();
    while READY_MASK.load(Ordering::Relaxed) & (1 << me) == 0 {
        assert!(COND.wait_infinite(&LOCK));
    }
    LOCK.unlock();

    SERVED.fetch_add(1, Ordering::Relaxed);
}

unsafe extern "C" fn consumer0(_: *mut ()) {
    consume(0)
}
unsafe extern "C" fn consumer1(_: *mut ()) {
    consume(1)
}
unsafe extern "C" fn consumer2(_: *mut ()) {
    consume(2)
}

static STACK_P: TaskStack<256> = TaskStack::new();
static STACK0: TaskStack<256> = TaskStack::new();
static STACK1: TaskStack<256> = TaskStack::new();
static STACK2: TaskStack<256> = TaskStack::new();

static PRODUCER: StaticTask =
    StaticTask::new(producer, core::ptr::null_mut(), &STACK_P, AccessMode::Privileged);
static CONSUMER0: StaticTask =
    StaticTask::new(consumer0, core::ptr::null_mut(), &STACK0, AccessMode::Privileged);
static CONSUMER1: StaticTask =
    StaticTask::new(consumer1, core::ptr::null_mut(), &STACK1, AccessMode::Privileged);
static CONSUMER2: StaticTask =
    StaticTask::new(consumer2, core::ptr::null_mut(), &STACK2, AccessMode::Privileged);

static KERNEL: Kernel<StdPort, SwitchStrategyRoundRobin, 4> =
    Kernel::new(KernelMode::DYNAMIC.union(KernelMode::SYNC), SwitchStrategyRoundRobin::new());

#[test]
fn condvar_predicate_loop() {
    let _ = env_logger::try_init();

    KERNEL.initialize();
    KERNEL.add_task(&PRODUCER);
    KERNEL.add_task(&CONSUMER0);
    KERNEL.add_task(&CONSUMER1);
    KERNEL.add_task(&CONSUMER2);

    KERNEL.start(TICK_RESOLUTION_DEFAULT_US);

    assert_eq!(SERVED.load(Ordering::Relaxed), CONSUMERS);
}
