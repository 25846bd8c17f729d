//! Earliest Deadline First (EDF) scheduling.
//!
//! Dynamic-priority scheduling: the task with the shortest relative
//! deadline is always selected for execution. Optimal on a uniprocessor up
//! to 100% utilization.
use super::{task_queue, SwitchStrategy};
use crate::task::TaskTable;
use crate::utils::{
    intrusive_list::{Idx, ListHead},
    Init,
};

/// Earliest Deadline First switching strategy.
pub struct SwitchStrategyEdf {
    tasks: ListHead,
}

impl Init for SwitchStrategyEdf {
    const INIT: Self = Self {
        tasks: ListHead::INIT,
    };
}

impl SwitchStrategyEdf {
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl Default for SwitchStrategyEdf {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchStrategy for SwitchStrategyEdf {
    fn add_task(&mut self, tasks: &mut TaskTable, task: Idx) {
        task_queue!(&mut self.tasks, tasks).push_back(task);
    }

    fn remove_task(&mut self, tasks: &mut TaskTable, task: Idx) {
        task_queue!(&mut self.tasks, tasks).unlink(task);
    }

    fn first_task(&mut self, _tasks: &mut TaskTable) -> Option<Idx> {
        self.tasks.first()
    }

    fn next_task(&mut self, tasks: &mut TaskTable, current: Option<Idx>, now: i64) -> Option<Idx> {
        let start = self.tasks.first()?;

        let mut earliest: Option<Idx> = None;
        let mut itr = start;
        loop {
            if !tasks[itr].is_sleeping()
                && earliest.map_or(true, |e| {
                    tasks[itr].hrt_relative_deadline(now) < tasks[e].hrt_relative_deadline(now)
                })
            {
                earliest = Some(itr);
            }

            itr = tasks[itr].link.unwrap().next.unwrap();
            if itr == start {
                break;
            }
        }

        // if no task is ready, stay on current (the kernel resolves the
        // all-asleep case to the sleep trap)
        earliest.or(current)
    }

    fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_util::{bound_pool, plain_task};

    #[test]
    fn earliest_relative_deadline_wins() {
        let mut pool = bound_pool::<3>(|_| plain_task());
        // deadlines 50, 20, 90 ticks; no work done yet
        pool[0].hrt_init(100, 50, 0);
        pool[1].hrt_init(100, 20, 0);
        pool[2].hrt_init(100, 90, 0);

        let mut s = SwitchStrategyEdf::new();
        for i in 0..3 {
            s.add_task(&mut pool, i);
        }

        assert_eq!(s.next_task(&mut pool, None, 0), Some(1));

        pool[1].time_sleep = -10;
        assert_eq!(s.next_task(&mut pool, None, 0), Some(0));

        // accumulated work shrinks the remaining margin: task 2's margin
        // (90 - 60 = 30) undercuts task 0's untouched 50
        pool[2].hrt.duration = 60;
        assert_eq!(s.next_task(&mut pool, None, 0), Some(2));

        // until task 0's own work shrinks its margin below that
        pool[0].hrt.duration = 45;
        assert_eq!(s.next_task(&mut pool, None, 0), Some(0));
    }

    #[test]
    fn all_asleep_returns_current() {
        let mut pool = bound_pool::<2>(|_| plain_task());
        pool[0].hrt_init(100, 50, 0);
        pool[1].hrt_init(100, 20, 0);

        let mut s = SwitchStrategyEdf::new();
        s.add_task(&mut pool, 0);
        s.add_task(&mut pool, 1);

        pool[0].time_sleep = -1;
        pool[1].time_sleep = -1;
        assert_eq!(s.next_task(&mut pool, Some(0), 0), Some(0));
    }
}
