//! Sleep accuracy: tasks sleeping 100/200/300 ms measure their elapsed
//! time in ticks. The wake must happen no earlier than the nominal
//! duration and within a small scheduling slack after it.
use std::sync::atomic::{AtomicI64, Ordering};

use stk_kernel::kernel::{Kernel, KernelMode};
use stk_kernel::strategy::SwitchStrategyRoundRobin;
use stk_kernel::task::{AccessMode, StaticTask, TaskStack};
use stk_kernel::{kernel_service, Port, TICK_RESOLUTION_DEFAULT_US};
use stk_port_std::StdPort;

/// Scheduling slack allowed on top of the nominal sleep, in ticks.
const SLACK_TICKS: i64 = 20;

static ELAPSED: [AtomicI64; 3] = [AtomicI64::new(-1), AtomicI64::new(-1), AtomicI64::new(-1)];

fn sleep_and_measure(me: usize, sleep_ms: u32) {
    let svc = kernel_service();

    let before = svc.ticks();
    svc.sleep(sleep_ms);
    let after = svc.ticks();

    ELAPSED[me].store(after - before, Ordering::Relaxed);
}

unsafe extern "C" fn task0(_: *mut ()) {
    sleep_and_measure(0, 100)
}
unsafe extern "C" fn task1(_: *mut ()) {
    sleep_and_measure(1, 200)
}
unsafe extern "C" fn task2(_: *mut ()) {
    sleep_and_measure(2, 300)
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
fn sleep_accuracy() {
    let _ = env_logger::try_init();

    KERNEL.initialize();
    KERNEL.add_task(&TASK0);
    KERNEL.add_task(&TASK1);
    KERNEL.add_task(&TASK2);

    KERNEL.start(TICK_RESOLUTION_DEFAULT_US);

    let tick_us = StdPort::tick_resolution_us() as i64;
    for (i, nominal_ms) in [(0, 100i64), (1, 200), (2, 300)] {
        let nominal_ticks = nominal_ms * 1000 / tick_us;
        let elapsed = ELAPSED[i].load(Ordering::Relaxed);
        assert!(
            elapsed >= nominal_ticks && elapsed <= nominal_ticks + SLACK_TICKS,
            "task {i}: slept {elapsed} ticks, expected about {nominal_ticks}"
        );
    }
}
