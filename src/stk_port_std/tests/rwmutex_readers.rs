//! Reader-writer mutex: readers overlap with each other but never with
//! the writer, and a waiting writer is not starved by the read side.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use stk_kernel::kernel::{Kernel, KernelMode};
use stk_kernel::strategy::SwitchStrategyRoundRobin;
use stk_kernel::sync::RwMutex;
use stk_kernel::task::{AccessMode, StaticTask, TaskStack};
use stk_kernel::{kernel_service, TICK_RESOLUTION_DEFAULT_US};
use stk_port_std::StdPort;

static RW: RwMutex = RwMutex::new();
static ACTIVE_READERS: AtomicUsize = AtomicUsize::new(0);
static MAX_CONCURRENT_READERS: AtomicUsize = AtomicUsize::new(0);
static WRITER_ACTIVE: AtomicBool = AtomicBool::new(false);
static OVERLAP_SEEN: AtomicBool = AtomicBool::new(false);
static WRITES: AtomicUsize = AtomicUsize::new(0);

fn read_loop() {
    let svc = kernel_service();

    for _ in 0..10 {
        RW.read_lock();

        let n = ACTIVE_READERS.fetch_add(1, Ordering::Relaxed) + 1;
        MAX_CONCURRENT_READERS.fetch_max(n, Ordering::Relaxed);
        if WRITER_ACTIVE.load(Ordering::Relaxed) {
            OVERLAP_SEEN.store(true, Ordering::Relaxed);
        }
        svc.delay(2);
        ACTIVE_READERS.fetch_sub(1, Ordering::Relaxed);

        RW.read_unlock();
        svc.sleep(3);
    }
}

unsafe extern "C" fn reader_a(_: *mut ()) {
    read_loop()
}
unsafe extern "C" fn reader_b(_: *mut ()) {
    read_loop()
}

unsafe extern "C" fn writer(_: *mut ()) {
    let svc = kernel_service();

    for _ in 0..5 {
        svc.sleep(7);
        RW.lock();

        WRITER_ACTIVE.store(true, Ordering::Relaxed);
        if ACTIVE_READERS.load(Ordering::Relaxed) != 0 {
            OVERLAP_SEEN.store(true, Ordering::Relaxed);
        }
        svc.delay(2);
        WRITER_ACTIVE.store(false, Ordering::Relaxed);

        RW.unlock();
        WRITES.fetch_add(1, Ordering::Relaxed);
    }
}

static STACK_A: TaskStack<256> = TaskStack::new();
static STACK_B: TaskStack<256> = TaskStack::new();
static STACK_W: TaskStack<256> = TaskStack::new();

static READER_A: StaticTask =
    StaticTask::new(reader_a, core::ptr::null_mut(), &STACK_A, AccessMode::Privileged);
static READER_B: StaticTask =
    StaticTask::new(reader_b, core::ptr::null_mut(), &STACK_B, AccessMode::Privileged);
static WRITER: StaticTask =
    StaticTask::new(writer, core::ptr::null_mut(), &STACK_W, AccessMode::Privileged);

static KERNEL: Kernel<StdPort, SwitchStrategyRoundRobin, 3> =
    Kernel::new(KernelMode::DYNAMIC.union(KernelMode::SYNC), SwitchStrategyRoundRobin::new());

#[test]
fn rwmutex_excludes_writers_from_readers() {
    let _ = env_logger::try_init();

    KERNEL.initialize();
    KERNEL.add_task(&READER_A);
    KERNEL.add_task(&READER_B);
    KERNEL.add_task(&WRITER);

    KERNEL.start(TICK_RESOLUTION_DEFAULT_US);

    assert!(!OVERLAP_SEEN.load(Ordering::Relaxed), "writer overlapped a reader");
    assert_eq!(WRITES.load(Ordering::Relaxed), 5);
    // the two readers did overlap with each other at least once
    assert!(MAX_CONCURRENT_READERS.load(Ordering::Relaxed) >= 2);
}
