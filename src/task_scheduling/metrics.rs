use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerMetrics {
    pub jobs_scheduled: u64,
    pub jobs_completed: u64,
    /// Batches run by any thread, including single jobs as one batch each.
    pub batches_executed: u64,
    /// Batches run on a caller thread while it waited or ran a job inline.
    pub inline_batches: u64,
    pub faults: u64,
    /// Tasks submitted but not yet handed to workers.
    pub pending_tasks: usize,
    pub flushes: u64,
}

impl SchedulerMetrics {
    /// Jobs accepted but not completed at snapshot time.
    pub fn jobs_in_flight(&self) -> u64 {
        self.jobs_scheduled.saturating_sub(self.jobs_completed)
    }
}

#[derive(Default)]
pub(crate) struct MetricsCounters {
    jobs_scheduled: AtomicU64,
    jobs_completed: AtomicU64,
    batches_executed: AtomicU64,
    inline_batches: AtomicU64,
    faults: AtomicU64,
    flushes: AtomicU64,
}

impl MetricsCounters {
    pub fn job_scheduled(&self) {
        self.jobs_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_executed(&self, inline: bool) {
        self.batches_executed.fetch_add(1, Ordering::Relaxed);
        if inline {
            self.inline_batches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flushed(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, pending_tasks: usize) -> SchedulerMetrics {
        SchedulerMetrics {
            jobs_scheduled: self.jobs_scheduled.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            batches_executed: self.batches_executed.load(Ordering::Relaxed),
            inline_batches: self.inline_batches.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            pending_tasks,
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let counters = MetricsCounters::default();
        counters.job_scheduled();
        counters.job_scheduled();
        counters.job_completed();
        counters.batch_executed(false);
        counters.batch_executed(true);
        counters.fault();
        counters.flushed();

        let snapshot = counters.snapshot(3);
        assert_eq!(snapshot.jobs_scheduled, 2);
        assert_eq!(snapshot.jobs_completed, 1);
        assert_eq!(snapshot.jobs_in_flight(), 1);
        assert_eq!(snapshot.batches_executed, 2);
        assert_eq!(snapshot.inline_batches, 1);
        assert_eq!(snapshot.faults, 1);
        assert_eq!(snapshot.flushes, 1);
        assert_eq!(snapshot.pending_tasks, 3);
    }
}
