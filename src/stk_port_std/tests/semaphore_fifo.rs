//! Semaphore FIFO order: four consumers enter the wait staggered in time;
//! a producer posts four paced signals. The direct-handover policy must
//! wake the consumers in the order they arrived.
use std::sync::atomic::{AtomicUsize, Ordering};

use stk_kernel::kernel::{Kernel, KernelMode};
use stk_kernel::strategy::SwitchStrategyRoundRobin;
use stk_kernel::sync::Semaphore;
use stk_kernel::task::{AccessMode, StaticTask, TaskStack};
use stk_kernel::{kernel_service, TICK_RESOLUTION_DEFAULT_US};
use stk_port_std::StdPort;

static SEM: Semaphore = Semaphore::new(0);
static WAKE_ORDER: [AtomicUsize; 4] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];
static WAKE_CURSOR: AtomicUsize = AtomicUsize::new(0);

fn consume(me: usize) {
    let svc = kernel_service();

    // stagger the arrivals: consumer 1 first, consumer 4 last
    svc.sleep(10 * me as u32);
    assert!(SEM.wait_infinite());

    let slot = WAKE_CURSOR.fetch_add(1, Ordering::Relaxed);
    WAKE_ORDER[slot].store(me, Ordering::Relaxed);
}

unsafe extern "C" fn producer(_: *mut ()) {
    let svc = kernel_service();

    // let every consumer queue up first
    svc.sleep(80);
    for _ in 0..4 {
        SEM.signal();
        svc.sleep(5);
    }
}

unsafe extern "C" fn consumer1(_: *mut ()) {
    consume(1)
}
unsafe extern "C" fn consumer2(_: *mut ()) {
    consume(2)
}
unsafe extern "C" fn consumer3(_: *mut ()) {
    consume(3)
}
unsafe extern "C" fn consumer4(_: *mut ()) {
    consume(4)
}

static STACK_P: TaskStack<256> = TaskStack::new();
static STACK1: TaskStack<256> = TaskStack::new();
static STACK2: TaskStack<256> = TaskStack::new();
static STACK3: TaskStack<256> = TaskStack::new();
static STACK4: TaskStack<256> = TaskStack::new();

static PRODUCER: StaticTask =
    StaticTask::new(producer, core::ptr::null_mut(), &STACK_P, AccessMode::Privileged);
static CONSUMER1: StaticTask =
    StaticTask::new(consumer1, core::ptr::null_mut(), &STACK1, AccessMode::Privileged);
static CONSUMER2: StaticTask =
    StaticTask::new(consumer2, core::ptr::null_mut(), &STACK2, AccessMode::Privileged);
static CONSUMER3: StaticTask =
    StaticTask::new(consumer3, core::ptr::null_mut(), &STACK3, AccessMode::Privileged);
static CONSUMER4: StaticTask =
    StaticTask::new(consumer4, core::ptr::null_mut(), &STACK4, AccessMode::Privileged);

static KERNEL: Kernel<StdPort, SwitchStrategyRoundRobin, 5> =
    Kernel::new(KernelMode::DYNAMIC.union(KernelMode::SYNC), SwitchStrategyRoundRobin::new());

#[test]
fn semaphore_wakes_in_fifo_order() {
    let _ = env_logger::try_init();

    KERNEL.initialize();
    KERNEL.add_task(&PRODUCER);
    KERNEL.add_task(&CONSUMER1);
    KERNEL.add_task(&CONSUMER2);
    KERNEL.add_task(&CONSUMER3);
    KERNEL.add_task(&CONSUMER4);

    KERNEL.start(TICK_RESOLUTION_DEFAULT_US);

    let order: Vec<usize> = WAKE_ORDER.iter().map(|w| w.load(Ordering::Relaxed)).collect();
    assert_eq!(order, vec![1, 2, 3, 4]);
    assert_eq!(SEM.count(), 0);
}
