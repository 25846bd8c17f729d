//! The scheduling kernel.
//!
//! [`Kernel`] owns the task table, the trap stacks, and the scheduler's
//! four-state machine, and multiplexes the admitted tasks onto the CPU
//! through the bound platform (`P`) and switching strategy (`S`).
//!
//! State machine: every tick (and every explicit yield/sleep/exit) the
//! kernel fetches the next event — `Switch`, `Sleep`, `Wake` or `Exit` —
//! by walking the strategy from the current task, then performs the
//! transition:
//!
//! | From \ Event   | Switch      | Sleep      | Wake     | Exit      |
//! |----------------|-------------|------------|----------|-----------|
//! | Switching      | Switching   | Sleeping   | —        | Exiting   |
//! | Sleeping       | —           | —          | Waking   | —         |
//! | Waking         | Switching   | Sleeping   | —        | Exiting   |
//! | Exiting        | —           | —          | —        | —         |
//!
//! Entering `Sleeping` swaps in the sleep-trap stack (the platform idles
//! in a WFI loop there); `Waking` swaps a task back in; `Exiting` swaps in
//! the exit-trap stack, which returns control to the caller of
//! [`Kernel::start`].
use core::marker::PhantomData;

use crate::klock::{self, CpuLockGuard};
use crate::port::{Port, PortEvents, StackKind};
use crate::service::{self, ticks_from_ms, KernelService};
use crate::strategy::SwitchStrategy;
use crate::sync::wait::{SyncObject, WaitChain, WaitObject, WaitOutcome, WaitRef};
use crate::sync::Mutex;
use crate::task::{
    AccessMode, KernelTask, Stack, Task, TaskFlags, TaskStack, Tid, STACK_SENTINEL,
};
use crate::utils::{intrusive_list::Idx, Init, TickCount};
use crate::{Timeout, STACK_SIZE_MIN};

bitflags::bitflags! {
    /// Kernel operating mode, chosen once per kernel instance.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KernelMode: u32 {
        /// Tasks may exit (or be removed) at run time; the kernel keeps an
        /// exit trap and [`Kernel::start`] returns when the last task is
        /// gone. Without this flag all tasks are static and `start` never
        /// returns.
        const DYNAMIC = 1 << 0;
        /// Hard Real-Time: task admission takes periodicity/deadline/start
        /// delay, and a missed deadline is fatal.
        const HRT = 1 << 1;
        /// Link the synchronization wait lists and their timeout walk into
        /// the tick handler.
        const SYNC = 1 << 2;
    }
}

impl KernelMode {
    /// All tasks are static and cannot be removed.
    pub const STATIC: Self = Self::empty();
}

/// Finite-state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsmState {
    Switching = 0,
    Sleeping = 1,
    Waking = 2,
    Exiting = 3,
}

/// Finite-state machine event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsmEvent {
    Switch = 0,
    Sleep = 1,
    Wake = 2,
    Exit = 3,
}

/// Transition table. `None` entries are events that do not change the
/// state in their row.
const FSM_TABLE: [[Option<FsmState>; 4]; 4] = {
    use FsmState::*;
    [
        // Switch          Sleep           Wake          Exit
        [Some(Switching), Some(Sleeping), None, Some(Exiting)], // Switching
        [None, None, Some(Waking), None],                       // Sleeping
        [Some(Switching), Some(Sleeping), None, Some(Exiting)], // Waking
        [None, None, None, None],                               // Exiting
    ]
};

/// Stack swap decided by one FSM step.
enum Swap {
    TaskToTask { idle: Idx, active: Idx },
    TaskToSleepTrap { idle: Idx },
    SleepTrapToTask { active: Idx },
    Exit,
}

/// A trap stack: descriptor plus the backing memory, used to execute the
/// sleep (WFI loop) and exit (return from `start`) traps.
struct TrapStack {
    stack: Stack,
    memory: TaskStack<STACK_SIZE_MIN>,
}

impl TrapStack {
    const fn new() -> Self {
        Self {
            stack: Stack::new(),
            memory: TaskStack::new(),
        }
    }
}

struct KernelState<S, const N: usize> {
    tasks: [KernelTask; N],
    strategy: S,
    task_now: Option<Idx>,
    fsm_state: Option<FsmState>,
    waiters: WaitChain,
    initialized: bool,
}

/// The scheduling kernel: a task table of capacity `N` scheduled by
/// strategy `S` on platform `P`.
///
/// The kernel instance must be placed in a `static`. Expects at least one
/// task before [`Kernel::start`].
pub struct Kernel<P: Port, S: SwitchStrategy, const N: usize> {
    state: klock::CpuLockCell<KernelState<S, N>>,
    ticks: TickCount,
    mode: KernelMode,
    /// Stack descriptors of the task slots; the port's context switch
    /// writes the saved SP through these.
    stacks: [Stack; N],
    sleep_trap: TrapStack,
    exit_trap: TrapStack,
    _port: PhantomData<P>,
}

// Safety: every piece of mutable state is accessed under CPU Lock (the
// `CpuLockCell`), via atomics (`TickCount`), or only by the context-switch
// path (`Stack`).
unsafe impl<P: Port, S: SwitchStrategy, const N: usize> Sync for Kernel<P, S, N> {}

impl<P: Port, S: SwitchStrategy, const N: usize> Kernel<P, S, N> {
    /// Construct a kernel in the given mode, scheduling with `strategy`.
    pub const fn new(mode: KernelMode, strategy: S) -> Self {
        assert!(N > 0, "kernel expects at least 1 task slot");
        Self {
            state: klock::CpuLockCell::new(KernelState {
                tasks: [KernelTask::INIT; N],
                strategy,
                task_now: None,
                fsm_state: None,
                waiters: WaitChain::INIT,
                initialized: false,
            }),
            ticks: TickCount::new(),
            mode,
            stacks: [Stack::INIT; N],
            sleep_trap: TrapStack::new(),
            exit_trap: TrapStack::new(),
            _port: PhantomData,
        }
    }

    /// Bind the platform: install its masking primitives and mark the
    /// kernel ready for task admission. Must be called exactly once.
    pub fn initialize(&'static self) {
        klock::install::<P>();

        let mut lock = klock::lock_cpu();
        let st = self.state.write(&mut *lock);
        assert!(!st.initialized, "kernel is already initialized");
        st.initialized = true;
    }

    /// Admit a task (non-HRT kernels).
    pub fn add_task(&'static self, task: &'static dyn Task) {
        assert!(
            !self.mode.contains(KernelMode::HRT),
            "HRT kernel tasks take periodicity and deadline; use add_task_hrt"
        );

        let mut lock = klock::lock_cpu();
        let st = self.state.write(&mut *lock);
        assert!(st.initialized, "kernel is not initialized");

        let slot = self.allocate_new_task(st, task);
        st.strategy.add_task(&mut st.tasks, slot);
    }

    /// Admit a task with its HRT parameters, in ticks. A positive
    /// `start_delay_tc` delays the task's first release.
    pub fn add_task_hrt(
        &'static self,
        task: &'static dyn Task,
        periodicity_tc: u32,
        deadline_tc: u32,
        start_delay_tc: u32,
    ) {
        assert!(self.mode.contains(KernelMode::HRT), "kernel is not in HRT mode");
        assert!(periodicity_tc != 0 && periodicity_tc < i32::MAX as u32);
        assert!(deadline_tc != 0 && deadline_tc < i32::MAX as u32);

        let mut lock = klock::lock_cpu();
        let st = self.state.write(&mut *lock);
        assert!(st.initialized, "kernel is not initialized");

        let slot = self.allocate_new_task(st, task);
        st.tasks[slot].hrt_init(periodicity_tc, deadline_tc, start_delay_tc);
        st.strategy.add_task(&mut st.tasks, slot);
    }

    /// Schedule a task's removal; the actual unlink happens on the next
    /// tick. Dynamic kernels only.
    pub fn remove_task(&'static self, task: &'static dyn Task) {
        assert!(
            self.mode.contains(KernelMode::DYNAMIC),
            "kernel mode must be DYNAMIC for tasks to be removable"
        );

        let mut lock = klock::lock_cpu();
        let st = self.state.write(&mut *lock);
        if let Some(i) = (0..N).find(|&i| {
            st.tasks[i]
                .user
                .is_some_and(|u| core::ptr::eq(u as *const dyn Task as *const (), task as *const dyn Task as *const ()))
        }) {
            st.tasks[i].schedule_removal();
        }
    }

    /// Start scheduling with a tick every `tick_us` microseconds.
    ///
    /// Returns exactly when the last dynamic task exits; never returns for
    /// a static kernel.
    pub fn start(&'static self, tick_us: u32) {
        assert!(tick_us != 0);

        {
            let mut lock = klock::lock_cpu();
            let st = self.state.write(&mut *lock);
            assert!(st.initialized, "kernel is not initialized");
            assert!(st.strategy.task_count() != 0, "kernel expects at least 1 task");
            st.task_now = None;
            st.fsm_state = None;
        }

        // trap stacks must be re-initialized on every subsequent start
        assert!(P::init_stack(
            StackKind::SleepTrap,
            &self.sleep_trap.stack,
            self.sleep_trap.memory.region(),
            None,
        ));
        let exit_trap = if self.mode.contains(KernelMode::DYNAMIC) {
            assert!(P::init_stack(
                StackKind::ExitTrap,
                &self.exit_trap.stack,
                self.exit_trap.memory.region(),
                None,
            ));
            Some(&self.exit_trap.stack)
        } else {
            None
        };

        service::bind(self);

        P::start(self, tick_us, exit_trap);
    }

    /// Run `f` against the strategy and the task table, under CPU Lock.
    /// Used for strategy-specific queries such as the monotonic
    /// schedulability analysis.
    pub fn with_strategy<R>(&'static self, f: impl FnOnce(&S, &[KernelTask]) -> R) -> R {
        let mut lock = klock::lock_cpu();
        let st = self.state.write(&mut *lock);
        f(&st.strategy, &st.tasks)
    }

    // ------------------------------------------------------------------
    // internals (all called under CPU Lock)

    /// Find a free slot for `task`, checking for task and stack collisions
    /// with the already-admitted ones, and initialize its stack.
    fn allocate_new_task(&self, st: &mut KernelState<S, N>, task: &'static dyn Task) -> Idx {
        let mut slot = None;
        for i in 0..N {
            if st.tasks[i].is_busy() {
                let other = st.tasks[i].user();
                // avoid task collision
                assert!(
                    !core::ptr::eq(
                        other as *const dyn Task as *const (),
                        task as *const dyn Task as *const ()
                    ),
                    "task is already added"
                );
                // avoid stack collision
                assert!(
                    other.stack().as_ptr() != task.stack().as_ptr(),
                    "tasks must not share a stack"
                );
            } else if slot.is_none() {
                slot = Some(i);
            }
        }

        // if this fails the compile-time task capacity was exceeded
        let slot = slot.expect("task capacity exceeded");

        assert!(
            P::init_stack(
                StackKind::UserTask,
                &self.stacks[slot],
                task.stack(),
                Some(task),
            ),
            "stack buffer is too small for the initial context"
        );

        st.tasks[slot].user = Some(task);
        slot
    }

    /// Map a caller stack pointer back to the owning slot.
    fn find_task_by_sp(st: &KernelState<S, N>, sp: usize) -> Option<Idx> {
        if let Some(now) = st.task_now {
            if st.tasks[now].is_memory_of_sp(sp) {
                return Some(now);
            }
        }
        (0..N).find(|&i| st.tasks[i].is_memory_of_sp(sp))
    }

    /// Strategy bookkeeping for a task that just went to sleep.
    fn note_sleep(st: &mut KernelState<S, N>, i: Idx) {
        if st.tasks[i].is_sleeping() && !st.tasks[i].flags.contains(TaskFlags::SLEEP_NOTIFIED) {
            st.tasks[i].flags |= TaskFlags::SLEEP_NOTIFIED;
            st.strategy.on_task_sleep(&mut st.tasks, i);
        }
    }

    /// Strategy bookkeeping for a task that just became runnable.
    fn note_wake(st: &mut KernelState<S, N>, i: Idx) {
        if st.tasks[i].flags.contains(TaskFlags::SLEEP_NOTIFIED) {
            st.tasks[i].flags -= TaskFlags::SLEEP_NOTIFIED;
            st.strategy.on_task_wake(&mut st.tasks, i);
        }
    }

    /// Advance the sleep timers of the sleeping tasks by one tick.
    fn update_task_sleep(st: &mut KernelState<S, N>) {
        for i in 0..N {
            if st.tasks[i].is_busy() && st.tasks[i].time_sleep < 0 {
                st.tasks[i].time_sleep += 1;
                if st.tasks[i].time_sleep == 0 {
                    Self::note_wake(st, i);
                }
            }
        }
    }

    /// HRT deadline accounting for a task being switched out.
    fn hrt_switched_out(&self, st: &mut KernelState<S, N>, i: Idx, ticks: i64) {
        let t = &mut st.tasks[i];
        let duration = t.hrt.duration + (ticks - t.hrt.last_ticks) as i32;
        t.hrt.duration = 0;

        assert!(duration >= 0);

        // check if the deadline was missed (HRT failure)
        if duration > t.hrt.deadline {
            t.user().on_deadline_missed(duration);
            P::hard_fault();
        }

        // force the task asleep until its next period
        t.time_sleep = -(t.hrt.periodicity - duration);
    }

    /// Walk the global waiter chain: decrement every outstanding timeout,
    /// releasing the waits that expire.
    fn tick_waiters(&self, lock: &mut CpuLockGuard) {
        let mut cur = {
            let st = self.state.write(&mut **lock);
            st.waiters.first()
        };
        while let Some(wref) = cur {
            // Safety: chained records are extant
            let w = unsafe { wref.as_ref() };

            // find the successor before we possibly unlink `wref`
            cur = w.chain_next();

            let t = w.timeout.get();
            if t < 0 {
                continue; // infinite wait
            }
            let t = t - 1;
            w.timeout.set(t);
            if t > 0 {
                continue;
            }

            // the wait expired
            w.is_timeout.set(true);
            // Safety: the sync object outlives its waiters
            let sync = unsafe { w.sync_obj.as_ref() };
            sync.wait_queue().unlink(wref);
            sync.on_waiter_removed(lock.borrow_mut(), w);

            let st = self.state.write(&mut **lock);
            st.waiters.unlink(wref);
            st.tasks[w.task].time_sleep = 0;
            Self::note_wake(st, w.task);
        }
    }

    /// Deassociate `wref` from everything and make its task runnable.
    /// The record must already be off its sync object's wait queue.
    fn complete_wait(&self, lock: &mut CpuLockGuard, wref: WaitRef, w: &WaitObject) {
        let st = self.state.write(&mut **lock);
        st.waiters.unlink(wref);
        st.tasks[w.task].time_sleep = 0;
        Self::note_wake(st, w.task);
    }

    /// Unlink a removal-pending task from the strategy and free its slot.
    fn remove_task_slot(st: &mut KernelState<S, N>, i: Idx) {
        st.strategy.remove_task(&mut st.tasks, i);
        st.tasks[i].unbind();
    }

    /// Fetch the next event for the FSM, together with the task to switch
    /// to (when the event calls for one).
    fn fetch_next_event(&self, st: &mut KernelState<S, N>, now: i64) -> (FsmEvent, Option<Idx>) {
        let dynamic = self.mode.contains(KernelMode::DYNAMIC);
        let hrt = self.mode.contains(KernelMode::HRT);

        let mut prev = st.task_now;
        let mut sleep_end: Option<Idx> = None;
        let mut pending_end: Option<Idx> = None;

        'walk: loop {
            let mut itr = st.strategy.next_task(&mut st.tasks, prev, now);

            if dynamic {
                // process pending task removals
                while let Some(i) = itr {
                    if !st.tasks[i].is_pending_removal() {
                        break;
                    }

                    // the current task can't be removed mid-switch (the
                    // switching driver context is branchless); make any
                    // other task current first, then remove this one
                    if Some(i) == st.task_now && pending_end != Some(i) {
                        // memorize as the end marker to avoid looping
                        // forever when every entry is pending exit
                        if pending_end.is_none() {
                            pending_end = Some(i);
                        }

                        if hrt && st.strategy.task_count() == 1 {
                            // the current task won't be switched out (it's
                            // the last one), so check its deadline here
                            self.hrt_switched_out(st, i, now);
                        }

                        prev = Some(i);
                        itr = st.strategy.next_task(&mut st.tasks, prev, now);
                        continue;
                    }

                    Self::remove_task_slot(st, i);
                    pending_end = None;

                    if st.strategy.task_count() == 0 {
                        return (FsmEvent::Exit, None);
                    }

                    itr = st.strategy.next_task(&mut st.tasks, prev, now);
                }
            }

            // check if the candidate is asleep
            if let Some(i) = itr {
                if st.tasks[i].is_sleeping() {
                    // iterated back to the marker: every task is asleep and
                    // the kernel must enter the sleep trap
                    if sleep_end == Some(i) {
                        return (FsmEvent::Sleep, None);
                    }
                    if sleep_end.is_none() {
                        sleep_end = Some(i);
                    }
                    prev = Some(i);
                    continue 'walk;
                }
            } else {
                // the strategy parked every task on its sleep queue
                return (FsmEvent::Sleep, None);
            }

            // if the kernel was sleeping, send the wake event first
            let ev = if st.fsm_state == Some(FsmState::Sleeping) {
                FsmEvent::Wake
            } else {
                FsmEvent::Switch
            };
            return (ev, itr);
        }
    }

    /// Assert that the bottom word of a task's stack still carries the
    /// sentinel (stack overflow detection).
    fn assert_stack_sentinel(st: &KernelState<S, N>, i: Idx) {
        // Safety: the region belongs to an admitted task
        let bottom = unsafe { st.tasks[i].user().stack().bottom_word() };
        assert!(bottom == STACK_SENTINEL, "task stack memory exceeded");
    }

    /// Run one FSM step and perform the associated stack swap.
    fn update_fsm(&'static self, lock: &mut CpuLockGuard) {
        let now = self.ticks.get();
        let hrt = self.mode.contains(KernelMode::HRT);

        let swap = {
            let st = self.state.write(&mut **lock);

            let fsm_state = st.fsm_state.expect("kernel is not started");
            let (event, next) = self.fetch_next_event(st, now);
            let Some(new_state) = FSM_TABLE[fsm_state as usize][event as usize] else {
                return;
            };
            st.fsm_state = Some(new_state);

            match new_state {
                FsmState::Switching => {
                    let idle = st.task_now.expect("no current task");
                    let active = next.expect("no next task");

                    // do nothing if the task does not change
                    if idle == active {
                        return;
                    }

                    Self::assert_stack_sentinel(st, idle);
                    Self::assert_stack_sentinel(st, active);

                    st.task_now = Some(active);

                    if hrt {
                        self.hrt_switched_out(st, idle, now);
                        st.tasks[active].hrt_on_switched_in(now);
                    }
                    Self::note_sleep(st, idle);

                    Swap::TaskToTask { idle, active }
                }
                FsmState::Waking => {
                    let active = next.expect("no next task");

                    Self::assert_stack_sentinel(st, active);

                    st.task_now = Some(active);

                    if hrt {
                        st.tasks[active].hrt_on_switched_in(now);
                    }

                    Swap::SleepTrapToTask { active }
                }
                FsmState::Sleeping => {
                    let idle = st.task_now.expect("no current task");
                    assert!(self.sleep_trap.stack.sp() != 0);

                    // anchor the next walk at some contained task
                    st.task_now = st.strategy.first_task(&mut st.tasks);

                    if hrt {
                        self.hrt_switched_out(st, idle, now);
                    }
                    Self::note_sleep(st, idle);

                    Swap::TaskToSleepTrap { idle }
                }
                FsmState::Exiting => {
                    // dynamic tasks need the exit trap provided by `start`
                    assert!(self.exit_trap.stack.sp() != 0);

                    st.task_now = None;

                    Swap::Exit
                }
            }
        };

        match swap {
            Swap::TaskToTask { idle, active } => {
                self.update_access_mode(lock, active);
                P::switch_context(Some(&self.stacks[idle]), &self.stacks[active]);
            }
            Swap::TaskToSleepTrap { idle } => {
                P::set_access_mode(AccessMode::Privileged);
                P::switch_context(Some(&self.stacks[idle]), &self.sleep_trap.stack);
            }
            Swap::SleepTrapToTask { active } => {
                self.update_access_mode(lock, active);
                P::switch_context(Some(&self.sleep_trap.stack), &self.stacks[active]);
            }
            Swap::Exit => {
                P::set_access_mode(AccessMode::Privileged);
                P::switch_context(None, &self.exit_trap.stack);
                P::stop();
            }
        }
    }

    /// Program the privilege level of the next task's Thread-mode code.
    fn update_access_mode(&self, lock: &mut CpuLockGuard, i: Idx) {
        let mode = {
            let st = self.state.write(&mut **lock);
            st.tasks[i].user().access_mode()
        };
        P::set_access_mode(mode);
    }

    /// Common path of yield (`sleep_ticks == 1`) and sleep from task code.
    fn task_sleep_request(&self, caller_sp: usize, sleep_ticks: u32) {
        let slot = {
            let mut lock = klock::lock_cpu();
            let st = self.state.write(&mut *lock);

            let slot = Self::find_task_by_sp(st, caller_sp)
                .expect("caller stack pointer does not belong to any task");

            if self.mode.contains(KernelMode::HRT) {
                st.tasks[slot].hrt_on_work_completed();
            }

            st.tasks[slot].time_sleep =
                st.tasks[slot].time_sleep.saturating_sub(sleep_ticks as i32);
            Self::note_sleep(st, slot);
            slot
        };

        // hold the task here until the next tick deschedules it and its
        // sleep elapses
        loop {
            {
                let mut lock = klock::lock_cpu();
                let st = self.state.write(&mut *lock);
                if st.tasks[slot].time_sleep >= 0 {
                    break;
                }
            }
            klock::relax_cpu();
        }
    }
}

impl<P: Port, S: SwitchStrategy, const N: usize> PortEvents for Kernel<P, S, N> {
    fn on_start(&'static self) -> &'static Stack {
        let mut lock = klock::lock_cpu();
        let now = self.ticks.get();

        let active = {
            let st = self.state.write(&mut *lock);

            let first = st
                .strategy
                .first_task(&mut st.tasks)
                .expect("kernel expects at least 1 task");
            st.task_now = Some(first);
            st.fsm_state = Some(FsmState::Switching);

            // in HRT mode every task can have a delayed start, so resolve
            // the real initial state
            if self.mode.contains(KernelMode::HRT) {
                let (event, next) = self.fetch_next_event(st, now);
                let new_state = FSM_TABLE[FsmState::Switching as usize][event as usize];

                // only SLEEPING or SWITCHING are expected here
                match new_state {
                    Some(FsmState::Switching) => {
                        if let Some(next) = next {
                            st.task_now = Some(next);
                        }
                    }
                    Some(FsmState::Sleeping) => st.fsm_state = Some(FsmState::Sleeping),
                    _ => unreachable!("unexpected initial scheduling state"),
                }
            }

            if st.fsm_state == Some(FsmState::Sleeping) {
                None
            } else {
                let i = st.task_now.unwrap();
                if self.mode.contains(KernelMode::HRT) {
                    st.tasks[i].hrt_on_switched_in(now);
                }
                Some(i)
            }
        };

        match active {
            Some(i) => {
                self.update_access_mode(&mut lock, i);
                &self.stacks[i]
            }
            None => {
                P::set_access_mode(AccessMode::Privileged);
                &self.sleep_trap.stack
            }
        }
    }

    fn on_tick(&'static self) {
        self.ticks.increment();

        let mut lock = klock::lock_cpu();
        {
            let st = self.state.write(&mut *lock);
            Self::update_task_sleep(st);
        }
        if self.mode.contains(KernelMode::SYNC) {
            self.tick_waiters(&mut lock);
        }
        self.update_fsm(&mut lock);
    }

    fn on_task_switch(&'static self, caller_sp: usize) {
        self.task_sleep_request(caller_sp, 1);
    }

    fn on_task_sleep(&'static self, caller_sp: usize, sleep_ticks: u32) {
        self.task_sleep_request(caller_sp, sleep_ticks);
    }

    fn on_task_exit(&'static self, stack: &Stack) {
        assert!(
            self.mode.contains(KernelMode::DYNAMIC),
            "kernel mode must be DYNAMIC for tasks to exit"
        );

        let mut lock = klock::lock_cpu();
        let st = self.state.write(&mut *lock);

        let slot = (0..N)
            .find(|&i| core::ptr::eq(&self.stacks[i] as *const Stack, stack as *const Stack))
            .expect("unknown task stack");
        st.tasks[slot].schedule_removal();
    }
}

impl<P: Port, S: SwitchStrategy, const N: usize> KernelService for Kernel<P, S, N> {
    fn ticks(&self) -> i64 {
        self.ticks.get()
    }

    fn tick_resolution_us(&self) -> i32 {
        P::tick_resolution_us()
    }

    fn delay(&self, delay_ms: u32) {
        let deadline = self.deadline_ticks(delay_ms);
        while self.ticks() < deadline {
            P::relax_cpu();
        }
    }

    fn sleep(&self, sleep_ms: u32) {
        // sleeping is not supported in HRT mode; an HRT task sleeps
        // according to its periodicity and workload
        assert!(!self.mode.contains(KernelMode::HRT));

        let ticks = ticks_from_ms(sleep_ms, P::tick_resolution_us());
        self.task_sleep_request(P::caller_sp(), ticks as u32);
    }

    fn switch_to_next(&self) {
        self.task_sleep_request(P::caller_sp(), 1);
    }

    fn current_tid(&self) -> Tid {
        if P::is_interrupt_context() {
            return 0;
        }
        let mut lock = klock::lock_cpu();
        let st = self.state.write(&mut *lock);
        st.task_now.map_or(0, |i| i + 1)
    }

    fn tls_ptr(&self) -> *mut () {
        let mut lock = klock::lock_cpu();
        let st = self.state.write(&mut *lock);
        let i = st.task_now.expect("no current task");
        st.tasks[i].tls
    }

    fn set_tls_ptr(&self, ptr: *mut ()) {
        let mut lock = klock::lock_cpu();
        let st = self.state.write(&mut *lock);
        let i = st.task_now.expect("no current task");
        st.tasks[i].tls = ptr;
    }

    fn start_waiting(
        &self,
        mut lock: CpuLockGuard,
        sync: &dyn SyncObject,
        release: Option<&Mutex>,
        timeout: Timeout,
    ) -> (CpuLockGuard, WaitOutcome) {
        assert!(
            self.mode.contains(KernelMode::SYNC),
            "kernel mode must include SYNC for blocking primitives"
        );
        assert!(!P::is_interrupt_context(), "blocking wait in an interrupt context");
        assert!(timeout != 0, "the zero-timeout fast path belongs to the caller");

        let slot = {
            let st = self.state.write(&mut *lock);
            st.task_now.expect("blocking wait outside task context")
        };

        let wait = WaitObject::new(slot, slot + 1, sync, timeout);
        let wref = WaitRef(core::ptr::NonNull::from(&wait));

        sync.wait_queue().push_back(wref);
        {
            let st = self.state.write(&mut *lock);
            st.waiters.push_back(wref);
            // park the task: off the runnable set until woken or timed out
            st.tasks[slot].time_sleep = i32::MIN;
            Self::note_sleep(st, slot);
        }

        if let Some(mutex) = release {
            // release while still inside the critical section
            mutex.release_for_wait(&mut lock, self, slot + 1);
        }

        // block until the waker (or the timeout walk) releases the record
        loop {
            klock::pause_cpu_lock(&mut lock);
            let st = self.state.write(&mut *lock);
            if st.tasks[slot].time_sleep >= 0 {
                break;
            }
        }

        // the releasing side fully unlinked the record
        debug_assert!(wait.link_queue.get().is_none());
        debug_assert!(wait.link_chain.get().is_none());

        let timed_out = wait.is_timeout();

        if let Some(mutex) = release {
            lock = mutex.reacquire_after_wait(lock, self, slot + 1);
        }

        (lock, WaitOutcome { timed_out })
    }

    fn wake_one(&self, lock: &mut CpuLockGuard, sync: &dyn SyncObject) -> bool {
        let Some(wref) = sync.wait_queue().pop_front() else {
            return false;
        };
        // Safety: the record was linked, hence extant
        let w = unsafe { wref.as_ref() };

        sync.on_waiter_removed(lock.borrow_mut(), w);
        self.complete_wait(lock, wref, w);

        true
    }

    fn wake_all(&self, lock: &mut CpuLockGuard, sync: &dyn SyncObject) -> usize {
        let mut woken = 0;
        while self.wake_one(lock, sync) {
            woken += 1;
        }
        woken
    }

    fn first_waiter_tid(&self, _lock: &mut CpuLockGuard, sync: &dyn SyncObject) -> Option<Tid> {
        sync.wait_queue()
            .first()
            // Safety: queued records are extant
            .map(|wref| unsafe { wref.as_ref() }.tid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::SwitchStrategyRoundRobin;
    use crate::task::{StackRegion, StaticTask, TaskStack};
    use core::mem::size_of;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A port that only counts context switches; "ISRs" are driven by the
    /// test calling `on_tick` directly.
    struct CountingPort;

    static SWITCHES: AtomicUsize = AtomicUsize::new(0);

    unsafe impl Port for CountingPort {
        fn start(_: &'static dyn PortEvents, _: u32, _: Option<&'static Stack>) {}
        fn stop() {}
        fn init_stack(
            _kind: StackKind,
            stack: &Stack,
            memory: StackRegion,
            _task: Option<&'static dyn Task>,
        ) -> bool {
            if memory.len() < 16 {
                return false;
            }
            for i in 0..memory.len() {
                unsafe { memory.as_ptr().add(i).write(STACK_SENTINEL) };
            }
            stack.set_sp(memory.as_ptr() as usize + (memory.len() - 16) * size_of::<usize>());
            true
        }
        fn switch_context(_idle: Option<&'static Stack>, _active: &'static Stack) {
            SWITCHES.fetch_add(1, Ordering::Relaxed);
        }
        fn set_access_mode(_: AccessMode) {}
        fn tick_resolution_us() -> i32 {
            1000
        }
        fn caller_sp() -> usize {
            0
        }
        unsafe fn enter_cpu_lock() {}
        unsafe fn leave_cpu_lock() {}
        fn is_cpu_lock_active() -> bool {
            false
        }
        fn is_interrupt_context() -> bool {
            false
        }
        fn relax_cpu() {}
        fn hard_fault() -> ! {
            panic!("hard fault");
        }
    }

    unsafe extern "C" fn nop_entry(_: *mut ()) {}

    #[test]
    fn ticks_rotate_two_tasks() {
        static STACK_A: TaskStack<64> = TaskStack::new();
        static STACK_B: TaskStack<64> = TaskStack::new();
        static TASK_A: StaticTask =
            StaticTask::new(nop_entry, core::ptr::null_mut(), &STACK_A, AccessMode::Privileged);
        static TASK_B: StaticTask =
            StaticTask::new(nop_entry, core::ptr::null_mut(), &STACK_B, AccessMode::Privileged);
        static KERNEL: Kernel<CountingPort, SwitchStrategyRoundRobin, 2> =
            Kernel::new(KernelMode::STATIC, SwitchStrategyRoundRobin::new());

        KERNEL.initialize();
        KERNEL.add_task(&TASK_A);
        KERNEL.add_task(&TASK_B);

        // `start` would do this before branching into the first task
        assert!(CountingPort::init_stack(
            StackKind::SleepTrap,
            &KERNEL.sleep_trap.stack,
            KERNEL.sleep_trap.memory.region(),
            None,
        ));

        let first = KERNEL.on_start();
        assert!(core::ptr::eq(first, &KERNEL.stacks[0]));

        // the first tick re-selects the already-running task; after that
        // every tick flips to the other one
        let base = SWITCHES.load(Ordering::Relaxed);
        KERNEL.on_tick();
        KERNEL.on_tick();
        KERNEL.on_tick();
        assert_eq!(SWITCHES.load(Ordering::Relaxed) - base, 2);
        assert_eq!(KERNEL.ticks(), 3);
    }

    #[test]
    fn hrt_admission_feeds_the_schedulability_analysis() {
        use crate::strategy::SwitchStrategyDm;

        static STACK_A: TaskStack<64> = TaskStack::new();
        static STACK_B: TaskStack<64> = TaskStack::new();
        static STACK_C: TaskStack<64> = TaskStack::new();
        static TASK_A: StaticTask =
            StaticTask::new(nop_entry, core::ptr::null_mut(), &STACK_A, AccessMode::Privileged);
        static TASK_B: StaticTask =
            StaticTask::new(nop_entry, core::ptr::null_mut(), &STACK_B, AccessMode::Privileged);
        static TASK_C: StaticTask =
            StaticTask::new(nop_entry, core::ptr::null_mut(), &STACK_C, AccessMode::Privileged);
        static KERNEL: Kernel<CountingPort, SwitchStrategyDm, 3> =
            Kernel::new(KernelMode::HRT, SwitchStrategyDm::new());

        KERNEL.initialize();
        KERNEL.add_task_hrt(&TASK_A, 20, 40, 0);
        KERNEL.add_task_hrt(&TASK_B, 30, 100, 0);
        KERNEL.add_task_hrt(&TASK_C, 10, 200, 0);

        let check = KERNEL.with_strategy(|s, tasks| s.check_schedulability::<3>(tasks));
        assert!(check.is_schedulable());
        assert_eq!(check.info[0].cpu_load.total, 50);
        assert_eq!(check.info[1].cpu_load.total, 80);
        assert_eq!(check.info[2].cpu_load.total, 85);
    }

    #[test]
    #[should_panic(expected = "task is already added")]
    fn double_add_is_a_programming_error() {
        static STACK: TaskStack<64> = TaskStack::new();
        static TASK: StaticTask =
            StaticTask::new(nop_entry, core::ptr::null_mut(), &STACK, AccessMode::Privileged);
        static KERNEL: Kernel<CountingPort, SwitchStrategyRoundRobin, 2> =
            Kernel::new(KernelMode::STATIC, SwitchStrategyRoundRobin::new());

        KERNEL.initialize();
        KERNEL.add_task(&TASK);
        KERNEL.add_task(&TASK);
    }

    #[test]
    #[should_panic(expected = "task capacity exceeded")]
    fn capacity_overflow_is_a_programming_error() {
        static STACK_A: TaskStack<64> = TaskStack::new();
        static STACK_B: TaskStack<64> = TaskStack::new();
        static TASK_A: StaticTask =
            StaticTask::new(nop_entry, core::ptr::null_mut(), &STACK_A, AccessMode::Privileged);
        static TASK_B: StaticTask =
            StaticTask::new(nop_entry, core::ptr::null_mut(), &STACK_B, AccessMode::Privileged);
        static KERNEL: Kernel<CountingPort, SwitchStrategyRoundRobin, 1> =
            Kernel::new(KernelMode::STATIC, SwitchStrategyRoundRobin::new());

        KERNEL.initialize();
        KERNEL.add_task(&TASK_A);
        KERNEL.add_task(&TASK_B);
    }
}
