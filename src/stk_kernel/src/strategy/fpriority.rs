//! Fixed-priority preemptive scheduling with round-robin within the same
//! priority.
//!
//! * Higher priority tasks always preempt lower ones.
//! * Tasks of equal priority are scheduled in round-robin fashion.
//! * Higher numeric value means higher priority; `0` is the lowest.
use super::{task_queue, SwitchStrategy};
use crate::task::{TaskFlags, TaskTable};
use crate::utils::{
    intrusive_list::{Idx, ListHead},
    Init,
};

/// Fixed-priority switching strategy with up to `MAX_PRIORITIES` levels
/// (at most 32, the width of the ready bitmap).
pub struct SwitchStrategyFixedPriority<const MAX_PRIORITIES: usize = 32> {
    /// Runnable tasks, one closed-loop list per priority.
    tasks: [ListHead; MAX_PRIORITIES],
    /// Sleeping tasks (priority irrelevant).
    sleep: ListHead,
    /// Bit = the corresponding priority has runnable tasks.
    ready_bitmap: u32,
    /// Round-robin cursor per priority.
    prev: [Option<Idx>; MAX_PRIORITIES],
}

/// Shortcut for the full 32-level variant.
pub type SwitchStrategyFp32 = SwitchStrategyFixedPriority<32>;

impl<const P: usize> Init for SwitchStrategyFixedPriority<P> {
    const INIT: Self = Self {
        tasks: [ListHead::INIT; P],
        sleep: ListHead::INIT,
        ready_bitmap: 0,
        prev: [None; P],
    };
}

impl<const P: usize> SwitchStrategyFixedPriority<P> {
    pub const fn new() -> Self {
        assert!(P >= 1 && P <= 32, "priority count exceeds the bitmap width");
        Self::INIT
    }

    #[inline]
    fn highest_ready_priority(bitmap: u32) -> usize {
        debug_assert!(bitmap != 0);
        (31 - bitmap.leading_zeros()) as usize
    }

    fn add_ready(&mut self, tasks: &mut TaskTable, task: Idx) {
        let prio = tasks[task].priority() as usize;

        task_queue!(&mut self.tasks[prio], tasks).push_back(task);

        if self.tasks[prio].len() == 1 {
            self.prev[prio] = Some(task);
            self.ready_bitmap |= 1 << prio;
        }
    }

    fn remove_ready(&mut self, tasks: &mut TaskTable, task: Idx) {
        let prio = tasks[task].priority() as usize;

        let mut q = task_queue!(&mut self.tasks[prio], tasks);
        let next = q.next_of(task).unwrap();
        q.unlink(task);

        if next != task {
            self.prev[prio] = q.prev_of(next);
        } else {
            self.prev[prio] = None;

            // this switches selection to a lower priority list
            self.ready_bitmap &= !(1 << prio);
        }
    }
}

impl<const P: usize> Default for SwitchStrategyFixedPriority<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const P: usize> SwitchStrategy for SwitchStrategyFixedPriority<P> {
    fn add_task(&mut self, tasks: &mut TaskTable, task: Idx) {
        let prio = tasks[task].priority() as usize;
        assert!(prio < P, "task priority out of range");

        let is_tail = self.prev[prio] == self.tasks[prio].last();

        self.add_ready(tasks, task);

        // if the cursor was pointing at the tail, become the tail
        if is_tail {
            self.prev[prio] = Some(task);
        }
    }

    fn remove_task(&mut self, tasks: &mut TaskTable, task: Idx) {
        assert!(self.task_count() != 0);

        if tasks[task].flags.contains(TaskFlags::SLEEP_NOTIFIED) {
            task_queue!(&mut self.sleep, tasks).unlink(task);
        } else {
            self.remove_ready(tasks, task);
        }
    }

    fn first_task(&mut self, _tasks: &mut TaskTable) -> Option<Idx> {
        if self.ready_bitmap == 0 {
            return self.sleep.first();
        }
        self.tasks[Self::highest_ready_priority(self.ready_bitmap)].first()
    }

    fn next_task(&mut self, tasks: &mut TaskTable, _current: Option<Idx>, _now: i64) -> Option<Idx> {
        if self.ready_bitmap == 0 {
            return None; // idle
        }

        let prio = Self::highest_ready_priority(self.ready_bitmap);

        let ret = task_queue!(&mut self.tasks[prio], tasks)
            .next_of(self.prev[prio].unwrap())
            .unwrap();
        self.prev[prio] = Some(ret);

        Some(ret)
    }

    fn task_count(&self) -> usize {
        self.sleep.len() + self.tasks.iter().map(|h| h.len()).sum::<usize>()
    }

    fn on_task_sleep(&mut self, tasks: &mut TaskTable, task: Idx) {
        debug_assert!(tasks[task].is_sleeping());

        self.remove_ready(tasks, task);
        task_queue!(&mut self.sleep, tasks).push_back(task);
    }

    fn on_task_wake(&mut self, tasks: &mut TaskTable, task: Idx) {
        debug_assert!(!tasks[task].is_sleeping());

        task_queue!(&mut self.sleep, tasks).unlink(task);
        self.add_ready(tasks, task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_util::bound_pool;
    use crate::task::{AccessMode, StaticTask, TaskStack};

    unsafe extern "C" fn nop_entry(_: *mut ()) {}

    fn task_with_priority(priority: u8) -> StaticTask {
        static STACK: TaskStack<64> = TaskStack::new();
        StaticTask::new(nop_entry, core::ptr::null_mut(), &STACK, AccessMode::Privileged)
            .with_priority(priority)
    }

    #[test]
    fn highest_priority_wins() {
        // priorities: task 0 -> 1, task 1 -> 7, task 2 -> 7
        let prios = [1u8, 7, 7];
        let mut pool = bound_pool::<3>(|i| task_with_priority(prios[i]));
        let mut s = SwitchStrategyFp32::new();
        for i in 0..3 {
            s.add_task(&mut pool, i);
        }

        // intra-priority RR between the two priority-7 tasks
        let mut order = Vec::new();
        let mut cur = s.first_task(&mut pool);
        for _ in 0..4 {
            cur = s.next_task(&mut pool, cur, 0);
            order.push(cur.unwrap());
        }
        assert_eq!(order, vec![1, 2, 1, 2]);
    }

    #[test]
    fn falls_back_to_lower_priority() {
        let prios = [0u8, 5];
        let mut pool = bound_pool::<2>(|i| task_with_priority(prios[i]));
        let mut s = SwitchStrategyFp32::new();
        s.add_task(&mut pool, 0);
        s.add_task(&mut pool, 1);

        assert_eq!(s.next_task(&mut pool, None, 0), Some(1));

        pool[1].time_sleep = -3;
        pool[1].flags |= TaskFlags::SLEEP_NOTIFIED;
        s.on_task_sleep(&mut pool, 1);
        assert_eq!(s.next_task(&mut pool, None, 0), Some(0));

        pool[1].time_sleep = 0;
        pool[1].flags -= TaskFlags::SLEEP_NOTIFIED;
        s.on_task_wake(&mut pool, 1);
        assert_eq!(s.next_task(&mut pool, None, 0), Some(1));
    }

    #[test]
    fn idle_when_everyone_sleeps() {
        let mut pool = bound_pool::<1>(|_| task_with_priority(3));
        let mut s = SwitchStrategyFp32::new();
        s.add_task(&mut pool, 0);

        pool[0].time_sleep = -1;
        pool[0].flags |= TaskFlags::SLEEP_NOTIFIED;
        s.on_task_sleep(&mut pool, 0);

        assert_eq!(s.next_task(&mut pool, None, 0), None);
        assert_eq!(s.first_task(&mut pool), Some(0));
    }
}
