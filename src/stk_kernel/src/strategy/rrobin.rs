//! Round-Robin: all tasks are given an equal amount of processing time.
use super::{task_queue, SwitchStrategy};
use crate::task::{TaskFlags, TaskTable};
use crate::utils::{
    intrusive_list::{Idx, ListHead},
    Init,
};

/// Round-Robin switching strategy.
///
/// Two closed-loop lists: runnable and sleeping. A cursor remembers the
/// previously scheduled task; `next_task` advances it inside the runnable
/// list. An empty runnable list with sleepers present requests the sleep
/// trap.
pub struct SwitchStrategyRoundRobin {
    tasks: ListHead,
    sleep: ListHead,
    prev: Option<Idx>,
}

impl Init for SwitchStrategyRoundRobin {
    const INIT: Self = Self {
        tasks: ListHead::INIT,
        sleep: ListHead::INIT,
        prev: None,
    };
}

impl SwitchStrategyRoundRobin {
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl Default for SwitchStrategyRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchStrategy for SwitchStrategyRoundRobin {
    fn add_task(&mut self, tasks: &mut TaskTable, task: Idx) {
        let is_tail = self.prev == self.tasks.last();

        task_queue!(&mut self.tasks, tasks).push_back(task);

        // if the cursor was pointing at the tail, become the tail
        if is_tail {
            self.prev = Some(task);
        }
    }

    fn remove_task(&mut self, tasks: &mut TaskTable, task: Idx) {
        assert!(self.task_count() != 0);

        if tasks[task].flags.contains(TaskFlags::SLEEP_NOTIFIED) {
            task_queue!(&mut self.sleep, tasks).unlink(task);
        } else {
            let mut q = task_queue!(&mut self.tasks, tasks);
            let next = q.next_of(task).unwrap();
            q.unlink(task);

            if next != task {
                self.prev = q.prev_of(next);
            } else {
                self.prev = None;
            }
        }
    }

    fn first_task(&mut self, _tasks: &mut TaskTable) -> Option<Idx> {
        self.tasks.first().or_else(|| self.sleep.first())
    }

    fn next_task(&mut self, tasks: &mut TaskTable, _current: Option<Idx>, _now: i64) -> Option<Idx> {
        let prev = self.prev?;
        let ret = task_queue!(&mut self.tasks, tasks).next_of(prev).unwrap();
        self.prev = Some(ret);
        Some(ret)
    }

    fn task_count(&self) -> usize {
        self.tasks.len() + self.sleep.len()
    }

    fn on_task_sleep(&mut self, tasks: &mut TaskTable, task: Idx) {
        debug_assert!(tasks[task].is_sleeping());

        let next = {
            let mut q = task_queue!(&mut self.tasks, tasks);
            let next = q.next_of(task).unwrap();
            q.unlink(task);
            next
        };
        task_queue!(&mut self.sleep, tasks).push_back(task);

        if next != task {
            self.prev = task_queue!(&mut self.tasks, tasks).prev_of(next);
        } else {
            self.prev = None;
        }
    }

    fn on_task_wake(&mut self, tasks: &mut TaskTable, task: Idx) {
        debug_assert!(!tasks[task].is_sleeping());

        task_queue!(&mut self.sleep, tasks).unlink(task);
        task_queue!(&mut self.tasks, tasks).push_back(task);

        if self.prev.is_none() {
            self.prev = Some(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_util::{bound_pool, plain_task};

    #[test]
    fn rotates_fairly() {
        let mut pool = bound_pool::<3>(|_| plain_task());
        let mut s = SwitchStrategyRoundRobin::new();
        for i in 0..3 {
            s.add_task(&mut pool, i);
        }

        let mut order = Vec::new();
        let mut cur = s.first_task(&mut pool);
        for _ in 0..6 {
            cur = s.next_task(&mut pool, cur, 0);
            order.push(cur.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn sleepers_leave_the_rotation() {
        let mut pool = bound_pool::<3>(|_| plain_task());
        let mut s = SwitchStrategyRoundRobin::new();
        for i in 0..3 {
            s.add_task(&mut pool, i);
        }

        pool[1].time_sleep = -5;
        pool[1].flags |= TaskFlags::SLEEP_NOTIFIED;
        s.on_task_sleep(&mut pool, 1);

        let mut order = Vec::new();
        let mut cur = Some(0);
        for _ in 0..4 {
            cur = s.next_task(&mut pool, cur, 0);
            order.push(cur.unwrap());
        }
        assert!(order.iter().all(|&i| i != 1));

        pool[1].time_sleep = 0;
        pool[1].flags -= TaskFlags::SLEEP_NOTIFIED;
        s.on_task_wake(&mut pool, 1);

        let mut seen = std::collections::HashSet::new();
        let mut cur = Some(0);
        for _ in 0..3 {
            cur = s.next_task(&mut pool, cur, 0);
            seen.insert(cur.unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn all_asleep_requests_sleep_trap() {
        let mut pool = bound_pool::<2>(|_| plain_task());
        let mut s = SwitchStrategyRoundRobin::new();
        s.add_task(&mut pool, 0);
        s.add_task(&mut pool, 1);

        for i in 0..2 {
            pool[i].time_sleep = -1;
            pool[i].flags |= TaskFlags::SLEEP_NOTIFIED;
            s.on_task_sleep(&mut pool, i);
        }
        assert_eq!(s.next_task(&mut pool, Some(0), 0), None);
        assert_eq!(s.task_count(), 2);
    }
}
