//! Event semantics: auto-reset wakes exactly one waiter per `set` and
//! consumes the signaled state; manual-reset wakes everyone at once; a
//! timed wait that nobody signals expires within its bound.
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use stk_kernel::kernel::{Kernel, KernelMode};
use stk_kernel::strategy::SwitchStrategyRoundRobin;
use stk_kernel::sync::Event;
use stk_kernel::task::{AccessMode, StaticTask, TaskStack};
use stk_kernel::{kernel_service, TICK_RESOLUTION_DEFAULT_US};
use stk_port_std::StdPort;

static AUTO: Event = Event::new();
static MANUAL: Event = Event::with_state(true, false);

static AUTO_WOKEN: AtomicUsize = AtomicUsize::new(0);
static MANUAL_WOKEN: AtomicUsize = AtomicUsize::new(0);
static TIMEOUT_TICKS: AtomicI64 = AtomicI64::new(-1);
static AUTO_RESIDUE: AtomicUsize = AtomicUsize::new(usize::MAX);

fn wait_both() {
    // phase 1: the auto-reset event is set twice; both waiters get
    // through, one per set
    assert!(AUTO.wait_infinite());
    AUTO_WOKEN.fetch_add(1, Ordering::Relaxed);

    // phase 2: a single manual-reset set releases everybody
    assert!(MANUAL.wait_infinite());
    MANUAL_WOKEN.fetch_add(1, Ordering::Relaxed);
}

unsafe extern "C" fn waiter_a(_: *mut ()) {
    wait_both()
}
unsafe extern "C" fn waiter_b(_: *mut ()) {
    wait_both()
}

unsafe extern "C" fn signaler(_: *mut ()) {
    let svc = kernel_service();

    // both waiters are parked on the auto-reset event by now
    svc.sleep(20);
    AUTO.set();
    svc.sleep(10);
    assert_eq!(AUTO_WOKEN.load(Ordering::Relaxed), 1);

    AUTO.set();
    svc.sleep(10);
    assert_eq!(AUTO_WOKEN.load(Ordering::Relaxed), 2);

    // each wake consumed the signaled state on its way out
    AUTO_RESIDUE.store(AUTO.try_wait() as usize, Ordering::Relaxed);

    // one manual-reset set releases all current waiters
    MANUAL.set();
    svc.sleep(10);
    assert_eq!(MANUAL_WOKEN.load(Ordering::Relaxed), 2);
    assert!(MANUAL.reset());

    // a timed wait with nobody signaling must expire on schedule
    let before = svc.ticks();
    assert!(!MANUAL.wait(25));
    TIMEOUT_TICKS.store(svc.ticks() - before, Ordering::Relaxed);
}

static STACK_A: TaskStack<256> = TaskStack::new();
static STACK_B: TaskStack<256> = TaskStack::new();
static STACK_S: TaskStack<256> = TaskStack::new();

static WAITER_A: StaticTask =
    StaticTask::new(waiter_a, core::ptr::null_mut(), &STACK_A, AccessMode::Privileged);
static WAITER_B: StaticTask =
    StaticTask::new(waiter_b, core::ptr::null_mut(), &STACK_B, AccessMode::Privileged);
static SIGNALER: StaticTask =
    StaticTask::new(signaler, core::ptr::null_mut(), &STACK_S, AccessMode::Privileged);

static KERNEL: Kernel<StdPort, SwitchStrategyRoundRobin, 3> =
    Kernel::new(KernelMode::DYNAMIC.union(KernelMode::SYNC), SwitchStrategyRoundRobin::new());

#[test]
fn event_signaling() {
    let _ = env_logger::try_init();

    KERNEL.initialize();
    KERNEL.add_task(&WAITER_A);
    KERNEL.add_task(&WAITER_B);
    KERNEL.add_task(&SIGNALER);

    KERNEL.start(TICK_RESOLUTION_DEFAULT_US);

    assert_eq!(AUTO_WOKEN.load(Ordering::Relaxed), 2);
    assert_eq!(MANUAL_WOKEN.load(Ordering::Relaxed), 2);
    // the auto-reset event ended up non-signaled
    assert_eq!(AUTO_RESIDUE.load(Ordering::Relaxed), 0);

    // `wait(t)` expires within `[t, t + slack]`
    let timeout = TIMEOUT_TICKS.load(Ordering::Relaxed);
    assert!((25..=45).contains(&timeout), "timed out after {timeout} ticks");
}
