//! Pipe back-pressure: with a capacity of 8, the 9th write blocks until
//! the consumer drains one element; the pipe then ends up full again.
use std::sync::atomic::{AtomicUsize, Ordering};

use stk_kernel::kernel::{Kernel, KernelMode};
use stk_kernel::strategy::SwitchStrategyRoundRobin;
use stk_kernel::sync::Pipe;
use stk_kernel::task::{AccessMode, StaticTask, TaskStack};
use stk_kernel::{kernel_service, TICK_RESOLUTION_DEFAULT_US, WAIT_INFINITE};
use stk_port_std::StdPort;

static PIPE: Pipe<u32, 8> = Pipe::new();
static FIRST_READ: AtomicUsize = AtomicUsize::new(usize::MAX);
static FINAL_COUNT: AtomicUsize = AtomicUsize::new(usize::MAX);
static BLOCKED_AT: AtomicUsize = AtomicUsize::new(usize::MAX);

unsafe extern "C" fn producer(_: *mut ()) {
    let svc = kernel_service();

    for v in 0..9u32 {
        if v == 8 {
            // the buffer is full here; this write has to block
            BLOCKED_AT.store(svc.ticks() as usize, Ordering::Relaxed);
        }
        assert!(PIPE.write(v, WAIT_INFINITE));
    }

    FINAL_COUNT.store(PIPE.len(), Ordering::Relaxed);
}

unsafe extern "C" fn consumer(_: *mut ()) {
    let svc = kernel_service();

    // give the producer time to fill the pipe and block on the 9th write
    svc.sleep(50);
    let v = PIPE.read(WAIT_INFINITE).unwrap();
    FIRST_READ.store(v as usize, Ordering::Relaxed);
}

static STACK_P: TaskStack<256> = TaskStack::new();
static STACK_C: TaskStack<256> = TaskStack::new();

static PRODUCER: StaticTask =
    StaticTask::new(producer, core::ptr::null_mut(), &STACK_P, AccessMode::Privileged);
static CONSUMER: StaticTask =
    StaticTask::new(consumer, core::ptr::null_mut(), &STACK_C, AccessMode::Privileged);

static KERNEL: Kernel<StdPort, SwitchStrategyRoundRobin, 2> =
    Kernel::new(KernelMode::DYNAMIC.union(KernelMode::SYNC), SwitchStrategyRoundRobin::new());

#[test]
fn pipe_back_pressure() {
    let _ = env_logger::try_init();

    KERNEL.initialize();
    KERNEL.add_task(&PRODUCER);
    KERNEL.add_task(&CONSUMER);

    KERNEL.start(TICK_RESOLUTION_DEFAULT_US);

    // the consumer drained the oldest element, and the blocked 9th write
    // refilled the freed slot
    assert_eq!(FIRST_READ.load(Ordering::Relaxed), 0);
    assert_eq!(FINAL_COUNT.load(Ordering::Relaxed), 8);
    assert_ne!(BLOCKED_AT.load(Ordering::Relaxed), usize::MAX);
}
