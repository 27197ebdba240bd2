use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::{Backoff, CachePadded};
use tracing::debug;

use super::pop_task_result::PopTaskResult;
use super::scheduler::SchedulerShared;

/// Wakes parked workers when work becomes ready.
pub(crate) struct WorkerCoordinator {
    unparkers: Vec<Unparker>,
    sleeping: Vec<CachePadded<AtomicBool>>,
    next: AtomicUsize,
}

impl WorkerCoordinator {
    pub fn new(unparkers: Vec<Unparker>) -> Self {
        let sleeping = unparkers
            .iter()
            .map(|_| CachePadded::new(AtomicBool::new(false)))
            .collect();
        Self {
            unparkers,
            sleeping,
            next: AtomicUsize::new(0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.unparkers.len()
    }

    /// Wakes up to `count` sleeping workers, starting after the last one woken.
    pub fn wake(&self, count: usize) {
        let workers = self.unparkers.len();
        if workers == 0 || count == 0 {
            return;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut woken = 0;
        for offset in 0..workers {
            let index = (start + offset) % workers;
            if self.sleeping[index].swap(false, Ordering::SeqCst) {
                self.unparkers[index].unpark();
                woken += 1;
                if woken == count {
                    break;
                }
            }
        }
    }

    pub fn wake_all(&self) {
        for (sleeping, unparker) in self.sleeping.iter().zip(&self.unparkers) {
            sleeping.store(false, Ordering::Release);
            unparker.unpark();
        }
    }

    fn mark_sleeping(&self, index: usize, sleeping: bool) {
        self.sleeping[index].store(sleeping, Ordering::SeqCst);
    }
}

/// A background thread popping and running tasks until the queue stops.
pub(crate) struct Worker {
    index: usize,
    parker: Parker,
    shared: Arc<SchedulerShared>,
}

impl Worker {
    pub fn new(index: usize, parker: Parker, shared: Arc<SchedulerShared>) -> Self {
        Self {
            index,
            parker,
            shared,
        }
    }

    pub fn run(self) {
        debug!(worker = self.index, "worker started");
        let backoff = Backoff::new();
        loop {
            match self.shared.queue().try_pop() {
                PopTaskResult::Success(task) => {
                    self.shared.execute(task, false);
                    backoff.reset();
                }
                PopTaskResult::Stop => break,
                PopTaskResult::Empty if !backoff.is_completed() => backoff.snooze(),
                PopTaskResult::Empty => {
                    self.sleep();
                    // Unflushed submissions still start within one park timeout.
                    self.shared.flush_pending();
                    backoff.reset();
                }
            }
        }
        debug!(worker = self.index, "worker stopped");
    }

    fn sleep(&self) {
        let coordinator = self.shared.coordinator();
        coordinator.mark_sleeping(self.index, true);
        if !self.shared.queue().has_ready() {
            self.parker.park_timeout(self.shared.idle_park_timeout());
        }
        coordinator.mark_sleeping(self.index, false);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn wake_unparks_only_sleeping_workers() {
        let parkers: Vec<Parker> = (0..3).map(|_| Parker::new()).collect();
        let coordinator =
            WorkerCoordinator::new(parkers.iter().map(|p| p.unparker().clone()).collect());
        assert_eq!(coordinator.worker_count(), 3);

        coordinator.mark_sleeping(1, true);
        coordinator.wake(2);

        // Worker 1 got a token and returns immediately; the others time out.
        let started = Instant::now();
        parkers[1].park_timeout(Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!coordinator.sleeping[1].load(Ordering::Acquire));
    }

    #[test]
    fn wake_all_unparks_everyone() {
        let parkers: Vec<Parker> = (0..2).map(|_| Parker::new()).collect();
        let coordinator =
            WorkerCoordinator::new(parkers.iter().map(|p| p.unparker().clone()).collect());
        coordinator.wake_all();
        let started = Instant::now();
        for parker in &parkers {
            parker.park_timeout(Duration::from_secs(5));
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
