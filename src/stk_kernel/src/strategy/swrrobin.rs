//! Smooth Weighted Round-Robin (SWRR).
//!
//! Distributes CPU time proportionally to weights while avoiding bursts by
//! smoothing the execution over time. Each selection step adds every
//! task's static weight to its dynamic "current weight", picks the task
//! with the highest current weight, and subtracts the sum of all weights
//! from the winner. Long-term execution ratios converge to the weights.
use super::{task_queue, SwitchStrategy};
use crate::task::TaskTable;
use crate::utils::{
    intrusive_list::{Idx, ListHead},
    Init,
};

/// The largest admissible static weight (24-bit).
pub const WEIGHT_MAX: i32 = 0x7f_ffff;

/// Smooth Weighted Round-Robin switching strategy.
pub struct SwitchStrategySwrr {
    tasks: ListHead,
    total_weight: i32,
}

impl Init for SwitchStrategySwrr {
    const INIT: Self = Self {
        tasks: ListHead::INIT,
        total_weight: 0,
    };
}

impl SwitchStrategySwrr {
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl Default for SwitchStrategySwrr {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchStrategy for SwitchStrategySwrr {
    fn add_task(&mut self, tasks: &mut TaskTable, task: Idx) {
        let weight = tasks[task].weight();
        assert!((1..=WEIGHT_MAX).contains(&weight), "weight out of range");

        tasks[task].current_weight = 0;

        task_queue!(&mut self.tasks, tasks).push_back(task);
        self.total_weight += weight;
    }

    fn remove_task(&mut self, tasks: &mut TaskTable, task: Idx) {
        self.total_weight -= tasks[task].weight();
        task_queue!(&mut self.tasks, tasks).unlink(task);
    }

    fn first_task(&mut self, _tasks: &mut TaskTable) -> Option<Idx> {
        self.tasks.first()
    }

    fn next_task(&mut self, tasks: &mut TaskTable, _current: Option<Idx>, _now: i64) -> Option<Idx> {
        let start = self.tasks.first()?;

        let mut selected = None;
        let mut max_weight = i32::MIN;
        let mut itr = start;
        loop {
            tasks[itr].current_weight += tasks[itr].weight();

            let candidate_weight = tasks[itr].current_weight;
            if candidate_weight > max_weight {
                max_weight = candidate_weight;
                selected = Some(itr);
            }

            itr = task_queue!(&mut self.tasks, tasks).next_of(itr).unwrap();
            if itr == start {
                break;
            }
        }

        let selected = selected.unwrap();
        tasks[selected].current_weight = max_weight - self.total_weight;

        Some(selected)
    }

    fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_util::bound_pool;
    use crate::task::{AccessMode, StaticTask, TaskStack};

    unsafe extern "C" fn nop_entry(_: *mut ()) {}

    fn task_with_weight(weight: i32) -> StaticTask {
        static STACK: TaskStack<64> = TaskStack::new();
        StaticTask::new(nop_entry, core::ptr::null_mut(), &STACK, AccessMode::Privileged)
            .with_weight(weight)
    }

    /// The classic nginx example: weights 5/1/1 produce the smooth
    /// schedule `a a b a c a a` instead of five consecutive `a`s.
    #[test]
    fn smooth_5_1_1() {
        let weights = [5, 1, 1];
        let mut pool = bound_pool::<3>(|i| task_with_weight(weights[i]));
        let mut s = SwitchStrategySwrr::new();
        for i in 0..3 {
            s.add_task(&mut pool, i);
        }

        let mut order = Vec::new();
        for _ in 0..7 {
            order.push(s.next_task(&mut pool, None, 0).unwrap());
        }
        assert_eq!(order, vec![0, 0, 1, 0, 2, 0, 0]);
    }

    /// Long-term selection ratios converge to the weights.
    #[test]
    fn ratios_converge() {
        let weights = [3, 2, 1];
        let mut pool = bound_pool::<3>(|i| task_with_weight(weights[i]));
        let mut s = SwitchStrategySwrr::new();
        for i in 0..3 {
            s.add_task(&mut pool, i);
        }

        let mut counts = [0usize; 3];
        for _ in 0..600 {
            counts[s.next_task(&mut pool, None, 0).unwrap()] += 1;
        }
        assert_eq!(counts, [300, 200, 100]);
    }

    #[test]
    fn removal_adjusts_total_weight() {
        let weights = [3, 1];
        let mut pool = bound_pool::<2>(|i| task_with_weight(weights[i]));
        let mut s = SwitchStrategySwrr::new();
        s.add_task(&mut pool, 0);
        s.add_task(&mut pool, 1);
        s.remove_task(&mut pool, 0);

        // only task 1 remains; it is selected every time
        for _ in 0..3 {
            assert_eq!(s.next_task(&mut pool, None, 0), Some(1));
        }
    }
}
