//! Rate-Monotonic / Deadline-Monotonic scheduling with RMUB and WCRT
//! schedulability checks.
//!
//! Tasks are kept sorted by fixed priority according to the selected
//! monotonic policy (shorter periodicity for RM, shorter deadline for DM);
//! the earliest entry has the highest priority.
use arrayvec::ArrayVec;
use num_integer::Integer;

use super::{task_queue, SwitchStrategy};
use crate::task::TaskTable;
use crate::utils::{
    intrusive_list::{Idx, ListHead},
    Init,
};

/// Period and execution time parameters used for the schedulability
/// analysis.
///
/// Each entry corresponds to a single periodic task, where `periodicity`
/// is the execution time `C` of the task and `deadline` is the task's
/// deadline `T`. The array must be ordered by priority (highest first)
/// before the analysis runs, which is the order the strategy keeps its
/// tasks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTiming {
    /// Execution time `C` of the task.
    pub periodicity: u32,
    /// Deadline `T` of the task.
    pub deadline: u32,
}

/// Calculated CPU load of a task, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCpuLoad {
    /// CPU load of the task itself.
    pub task: u16,
    /// Cumulative CPU load reached by this task.
    pub total: u16,
}

/// Calculated task details (CPU load, WCRT).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskInfo {
    pub cpu_load: TaskCpuLoad,
    /// Worst-Case Response Time of the task (ticks).
    pub wcrt: u32,
}

/// Result of a Worst-Case Response Time schedulability test over a task
/// set of compile-time size `N`.
#[derive(Debug, Clone, Copy)]
pub struct SchedulabilityCheck<const N: usize> {
    /// Whether every task meets its deadline.
    pub schedulable: bool,
    /// Computed per-task info, in priority order (highest first).
    pub info: [TaskInfo; N],
}

impl<const N: usize> SchedulabilityCheck<N> {
    #[inline]
    pub fn is_schedulable(&self) -> bool {
        self.schedulable
    }
}

/// Monotonic switching strategy. `DEADLINE_ORDER` selects
/// Deadline-Monotonic ordering; `false` selects Rate-Monotonic.
pub struct SwitchStrategyMonotonic<const DEADLINE_ORDER: bool> {
    tasks: ListHead,
}

/// Rate-Monotonic: smaller periodicity means higher priority.
pub type SwitchStrategyRm = SwitchStrategyMonotonic<false>;

/// Deadline-Monotonic: shorter deadline means higher priority.
pub type SwitchStrategyDm = SwitchStrategyMonotonic<true>;

impl<const D: bool> Init for SwitchStrategyMonotonic<D> {
    const INIT: Self = Self {
        tasks: ListHead::INIT,
    };
}

impl<const D: bool> SwitchStrategyMonotonic<D> {
    pub const fn new() -> Self {
        Self::INIT
    }

    #[inline]
    fn sort_key(tasks: &TaskTable, i: Idx) -> i32 {
        if D {
            tasks[i].hrt_deadline()
        } else {
            tasks[i].hrt_periodicity()
        }
    }

    /// Collect the task set's timing parameters in priority order and run
    /// the WCRT analysis. `N` must match the number of admitted tasks.
    pub fn check_schedulability<const N: usize>(&self, tasks: &TaskTable) -> SchedulabilityCheck<N> {
        assert_eq!(self.tasks.len(), N, "task count mismatch");

        let mut timings = ArrayVec::<TaskTiming, N>::new();
        let start = self.tasks.first().unwrap();
        let mut itr = start;
        loop {
            timings.push(TaskTiming {
                periodicity: tasks[itr].hrt_periodicity() as u32,
                deadline: tasks[itr].hrt_deadline() as u32,
            });
            itr = tasks[itr].link.unwrap().next.unwrap();
            if itr == start {
                break;
            }
        }

        let mut info = [TaskInfo::default(); N];
        task_cpu_load(&timings, &mut info);
        let schedulable = calculate_wcrt(&timings, &mut info);

        SchedulabilityCheck { schedulable, info }
    }
}

impl<const D: bool> Default for SwitchStrategyMonotonic<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const D: bool> SwitchStrategy for SwitchStrategyMonotonic<D> {
    fn add_task(&mut self, tasks: &mut TaskTable, task: Idx) {
        if self.tasks.is_empty() {
            task_queue!(&mut self.tasks, tasks).push_front(task);
            return;
        }

        let key = Self::sort_key(tasks, task);
        let start = self.tasks.first().unwrap();
        let mut itr = start;
        loop {
            if key < Self::sort_key(tasks, itr) {
                task_queue!(&mut self.tasks, tasks).insert_before(task, itr);
                break;
            }

            itr = task_queue!(&mut self.tasks, tasks).next_of(itr).unwrap();

            // end of the list
            if itr == start {
                task_queue!(&mut self.tasks, tasks).push_back(task);
                break;
            }
        }
    }

    fn remove_task(&mut self, tasks: &mut TaskTable, task: Idx) {
        task_queue!(&mut self.tasks, tasks).unlink(task);
    }

    fn first_task(&mut self, _tasks: &mut TaskTable) -> Option<Idx> {
        self.tasks.first()
    }

    fn next_task(&mut self, tasks: &mut TaskTable, current: Option<Idx>, _now: i64) -> Option<Idx> {
        let start = self.tasks.first()?;

        // highest priority = earliest in the sorted list
        let mut itr = start;
        loop {
            if !tasks[itr].is_sleeping() {
                return Some(itr);
            }
            itr = task_queue!(&mut self.tasks, tasks).next_of(itr).unwrap();
            if itr == start {
                break;
            }
        }

        // no task ready: idle (the kernel resolves this to the sleep trap)
        current
    }

    fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

/// Calculate the Worst-Case Response Time for a set of fixed-priority
/// periodic tasks.
///
/// For each task `x` the WCRT value is computed iteratively according to
///
/// ```text
/// W = Cx + Σ ceil(W / Tj) * Cj
/// ```
///
/// where the summation runs over all tasks `j` with higher priority. The
/// iteration terminates when the response time converges or exceeds the
/// task's deadline. `timings` must be ordered by priority, highest first.
///
/// Returns `true` if every task meets its deadline (`W <= T`).
pub fn calculate_wcrt(timings: &[TaskTiming], info: &mut [TaskInfo]) -> bool {
    assert_eq!(timings.len(), info.len());
    if timings.is_empty() {
        return true;
    }

    let mut schedulable = true;
    info[0].wcrt = timings[0].periodicity;

    for t in 1..timings.len() {
        let cx = timings[t].periodicity;
        let tx = timings[t].deadline;
        let mut w0 = cx;

        loop {
            let mut w = cx;
            for j in &timings[..t] {
                w += Integer::div_ceil(&w0, &j.deadline) * j.periodicity;
            }

            if w != w0 && w <= tx {
                w0 = w;
            } else {
                schedulable &= w <= tx;
                info[t].wcrt = w;
                break;
            }
        }
    }

    schedulable
}

/// Calculate the CPU load of the task set, in percent.
pub fn task_cpu_load(timings: &[TaskTiming], info: &mut [TaskInfo]) {
    assert_eq!(timings.len(), info.len());

    let mut total: u16 = 0;
    for (timing, info) in timings.iter().zip(info.iter_mut()) {
        let task_load = (timing.periodicity * 100 / timing.deadline) as u16;
        total += task_load;

        info.cpu_load.task = task_load;
        info.cpu_load.total = total;
    }
}

/// The Liu & Layland Rate-Monotonic utilization bound for `n` tasks, in
/// permille: `1000 * n * (2^(1/n) - 1)`.
///
/// A task set whose total utilization stays below this bound is
/// schedulable under RM regardless of its phasing.
pub fn rmub_permille(n: u32) -> u32 {
    // n * (2^(1/n) - 1), precomputed; converges towards ln 2 ≈ 0.693
    const TABLE: [u32; 10] = [1000, 828, 780, 757, 743, 735, 729, 724, 721, 718];
    match n {
        0 => 1000,
        1..=10 => TABLE[(n - 1) as usize],
        _ => 693,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_util::{bound_pool, plain_task};

    fn hrt_pool<const N: usize>(params: [(u32, u32); N]) -> Vec<crate::task::KernelTask> {
        let mut pool = bound_pool::<N>(|_| plain_task());
        for (i, (periodicity, deadline)) in params.into_iter().enumerate() {
            pool[i].hrt_init(periodicity, deadline, 0);
        }
        pool
    }

    #[test]
    fn rm_sorts_by_periodicity() {
        let mut pool = hrt_pool([(300, 50), (100, 40), (200, 60)]);
        let mut s = SwitchStrategyRm::new();
        for i in 0..3 {
            s.add_task(&mut pool, i);
        }

        // shortest period first: 1 (100), 2 (200), 0 (300)
        assert_eq!(s.first_task(&mut pool), Some(1));
        assert_eq!(s.next_task(&mut pool, Some(1), 0), Some(1));

        pool[1].time_sleep = -10;
        assert_eq!(s.next_task(&mut pool, Some(1), 0), Some(2));
        pool[2].time_sleep = -10;
        assert_eq!(s.next_task(&mut pool, Some(1), 0), Some(0));
    }

    #[test]
    fn dm_sorts_by_deadline() {
        let mut pool = hrt_pool([(300, 50), (100, 40), (200, 60)]);
        let mut s = SwitchStrategyDm::new();
        for i in 0..3 {
            s.add_task(&mut pool, i);
        }

        // shortest deadline first: 1 (40), 0 (50), 2 (60)
        assert_eq!(s.first_task(&mut pool), Some(1));
        pool[1].time_sleep = -10;
        assert_eq!(s.next_task(&mut pool, Some(1), 0), Some(0));
    }

    #[test]
    fn wcrt_schedulable_set() {
        // {C=20, T=40}, {C=30, T=100}, {C=10, T=200}
        let timings = [
            TaskTiming { periodicity: 20, deadline: 40 },
            TaskTiming { periodicity: 30, deadline: 100 },
            TaskTiming { periodicity: 10, deadline: 200 },
        ];
        let mut info = [TaskInfo::default(); 3];

        task_cpu_load(&timings, &mut info);
        assert_eq!(info[0].cpu_load.total, 50);
        assert_eq!(info[1].cpu_load.total, 80);
        assert_eq!(info[2].cpu_load.total, 85);

        assert!(calculate_wcrt(&timings, &mut info));
        assert_eq!(info[0].wcrt, 20);
        assert!(info[1].wcrt <= 100);
        assert!(info[2].wcrt <= 200);
    }

    #[test]
    fn wcrt_unschedulable_set() {
        // {C=50, T=50}, {C=30, T=60}: utilization 1.5
        let timings = [
            TaskTiming { periodicity: 50, deadline: 50 },
            TaskTiming { periodicity: 30, deadline: 60 },
        ];
        let mut info = [TaskInfo::default(); 2];
        assert!(!calculate_wcrt(&timings, &mut info));
    }

    #[test]
    fn rmub_bounds() {
        assert_eq!(rmub_permille(1), 1000);
        assert_eq!(rmub_permille(2), 828);
        assert_eq!(rmub_permille(3), 780);
        assert_eq!(rmub_permille(100), 693);
    }
}
