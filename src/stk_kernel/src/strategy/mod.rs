//! Task switching strategies.
//!
//! A strategy is a pure selection policy over the kernel's task table. The
//! kernel owns the table; a strategy owns its queue heads and cursors and
//! reaches the per-task link words through arena indices.
use crate::task::TaskTable;
use crate::utils::intrusive_list::Idx;

mod edf;
mod fpriority;
mod monotonic;
mod rrobin;
mod swrrobin;

pub use self::edf::SwitchStrategyEdf;
pub use self::fpriority::{SwitchStrategyFixedPriority, SwitchStrategyFp32};
pub use self::monotonic::{
    SchedulabilityCheck, SwitchStrategyDm, SwitchStrategyMonotonic, SwitchStrategyRm, TaskCpuLoad,
    TaskInfo, TaskTiming,
};
pub use self::rrobin::SwitchStrategyRoundRobin;
pub use self::swrrobin::SwitchStrategySwrr;

/// A task switching strategy.
///
/// All methods are invoked by the kernel under CPU Lock. `task` arguments
/// are indices into the kernel's task table.
pub trait SwitchStrategy: Send + 'static {
    /// Admit a task. The task's slot is already bound.
    fn add_task(&mut self, tasks: &mut TaskTable, task: Idx);

    /// Withdraw a task. Panics if the strategy does not contain it.
    fn remove_task(&mut self, tasks: &mut TaskTable, task: Idx);

    /// Some task to start scheduling with. The kernel re-selects on the
    /// first tick, so any contained task will do.
    fn first_task(&mut self, tasks: &mut TaskTable) -> Option<Idx>;

    /// The task to run after `current`. `None` means "no runnable task;
    /// enter the sleep trap". Strategies without a sleep sub-queue may
    /// return a sleeping task (or `current` itself); the kernel detects
    /// the all-asleep case by watching for a repeated candidate.
    fn next_task(&mut self, tasks: &mut TaskTable, current: Option<Idx>, now: i64) -> Option<Idx>;

    /// Number of tasks currently contained (runnable and sleeping).
    fn task_count(&self) -> usize;

    /// The kernel observed `task` going to sleep. Strategies with a sleep
    /// sub-queue move the task there.
    fn on_task_sleep(&mut self, tasks: &mut TaskTable, task: Idx) {
        let _ = (tasks, task);
    }

    /// The kernel observed `task` waking up. Paired with
    /// [`SwitchStrategy::on_task_sleep`].
    fn on_task_wake(&mut self, tasks: &mut TaskTable, task: Idx) {
        let _ = (tasks, task);
    }
}

/// Get a [`crate::utils::intrusive_list::ListAccessor`] over a strategy
/// queue in the kernel task table.
macro_rules! task_queue {
    ($head:expr, $tasks:expr) => {
        crate::utils::intrusive_list::ListAccessor::new($head, $tasks, |t: &mut crate::task::KernelTask| {
            t.link_mut()
        })
    };
}
pub(crate) use task_queue;

#[cfg(test)]
pub(crate) mod test_util {
    use crate::task::{AccessMode, KernelTask, StaticTask, Task, TaskStack};
    use crate::utils::Init;

    unsafe extern "C" fn nop_entry(_: *mut ()) {}

    /// Build a pool of bound kernel-task slots for strategy unit tests.
    pub(crate) fn bound_pool<const N: usize>(mk: impl Fn(usize) -> StaticTask) -> Vec<KernelTask> {
        (0..N)
            .map(|i| {
                let user: &'static dyn Task = Box::leak(Box::new(mk(i)));
                let mut t = KernelTask::INIT;
                t.user = Some(user);
                t
            })
            .collect()
    }

    pub(crate) fn plain_task() -> StaticTask {
        static STACK: TaskStack<64> = TaskStack::new();
        StaticTask::new(nop_entry, core::ptr::null_mut(), &STACK, AccessMode::Privileged)
    }
}
