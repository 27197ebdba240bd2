//! Two-stage task queue shared by the workers.
//!
//! Submissions land in a pending list first and only become visible to
//! workers when flushed. Work unlocked by a finishing dependency skips the
//! pending stage and goes straight to the ready queue.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use super::pop_task_result::PopTaskResult;
use super::task::Task;

pub(crate) struct TaskQueue {
    ready: SegQueue<Task>,
    pending: Mutex<Vec<Task>>,
    /// Kept on its own cache line; every idle worker polls it.
    stop: CachePadded<AtomicBool>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            ready: SegQueue::new(),
            pending: Mutex::new(Vec::new()),
            stop: CachePadded::new(AtomicBool::new(false)),
        }
    }

    /// Attempts to pop a ready task.
    ///
    /// `Stop` is only reported once the ready queue has drained.
    pub fn try_pop(&self) -> PopTaskResult {
        match self.ready.pop() {
            Some(task) => PopTaskResult::Success(task),
            None if self.stop.load(Ordering::Acquire) => PopTaskResult::Stop,
            None => PopTaskResult::Empty,
        }
    }

    pub fn push_ready(&self, tasks: impl IntoIterator<Item = Task>) {
        for task in tasks {
            self.ready.push(task);
        }
    }

    /// Appends to the pending list and returns its new length.
    pub fn push_pending(&self, tasks: impl IntoIterator<Item = Task>) -> usize {
        let mut pending = self.pending.lock();
        pending.extend(tasks);
        pending.len()
    }

    /// Moves every pending task to the ready queue in submission order.
    pub fn flush(&self) -> usize {
        let tasks = std::mem::take(&mut *self.pending.lock());
        let count = tasks.len();
        self.push_ready(tasks);
        count
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Workers exit the next time they find the ready queue empty.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};

    use super::*;
    use crate::task_scheduling::job::Job;
    use crate::task_scheduling::job_handle::{JobKind, JobState};

    struct Nothing;

    impl Job for Nothing {
        fn execute(&mut self) {}
    }

    fn task() -> Task {
        let state = Arc::new(JobState::new("nothing", JobKind::Work, Vec::new(), Weak::new()));
        state.set_remaining(1);
        Task::single(Box::new(Nothing), state)
    }

    #[test]
    fn pending_tasks_are_invisible_until_flushed() {
        let queue = TaskQueue::new();
        assert_eq!(queue.push_pending([task(), task()]), 2);
        assert!(matches!(queue.try_pop(), PopTaskResult::Empty));
        assert_eq!(queue.pending_len(), 2);

        assert_eq!(queue.flush(), 2);
        assert_eq!(queue.pending_len(), 0);
        assert!(matches!(queue.try_pop(), PopTaskResult::Success(_)));
        assert!(matches!(queue.try_pop(), PopTaskResult::Success(_)));
        assert!(matches!(queue.try_pop(), PopTaskResult::Empty));
    }

    #[test]
    fn stop_waits_for_ready_work_to_drain() {
        let queue = TaskQueue::new();
        queue.push_ready([task()]);
        queue.request_stop();
        assert!(matches!(queue.try_pop(), PopTaskResult::Success(_)));
        assert!(matches!(queue.try_pop(), PopTaskResult::Stop));
    }
}
