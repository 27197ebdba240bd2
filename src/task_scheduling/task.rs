//! Units of work handed to workers.

use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::trace;

use super::job::{Job, JobFor};
use super::job_handle::JobState;
use super::scheduler::Dispatch;
use crate::error::RoutineFault;
use crate::memory::ExecutionScope;

/// The two shapes a routine can take.
pub(crate) enum Routine {
    Single(Box<dyn Job>),
    Indexed {
        job: Arc<dyn JobFor>,
        range: Range<usize>,
        /// Whole-range execution on one thread; any index may be written.
        exclusive: bool,
    },
}

/// One schedulable unit: a single job, or one batch of an indexed job.
pub(crate) struct Task {
    routine: Routine,
    state: Arc<JobState>,
}

impl Task {
    pub fn single(job: Box<dyn Job>, state: Arc<JobState>) -> Self {
        Self {
            routine: Routine::Single(job),
            state,
        }
    }

    pub fn batch(job: Arc<dyn JobFor>, range: Range<usize>, state: Arc<JobState>) -> Self {
        Self {
            routine: Routine::Indexed {
                job,
                range,
                exclusive: false,
            },
            state,
        }
    }

    pub fn sequential(job: Arc<dyn JobFor>, count: usize, state: Arc<JobState>) -> Self {
        Self {
            routine: Routine::Indexed {
                job,
                range: 0..count,
                exclusive: true,
            },
            state,
        }
    }

    /// Splits `[0, count)` into batches of at most `batch_size` indices.
    pub fn batches(
        job: &Arc<dyn JobFor>,
        count: usize,
        batch_size: usize,
        state: &Arc<JobState>,
    ) -> Vec<Task> {
        debug_assert!(batch_size > 0);
        (0..count)
            .step_by(batch_size)
            .map(|start| {
                let end = start.saturating_add(batch_size).min(count);
                Task::batch(job.clone(), start..end, state.clone())
            })
            .collect()
    }

    /// Runs the routine, then notifies the job that this unit is done.
    ///
    /// A panic in the routine is recorded on the job and passed to `on_fault`
    /// before the job can complete.
    pub fn run(self, on_fault: impl FnOnce(&RoutineFault)) {
        let Task { routine, state } = self;
        let outcome = match routine {
            Routine::Single(mut job) => {
                let _scope = ExecutionScope::exclusive(state.token());
                trace!(job = state.label(), "executing job");
                panic::catch_unwind(AssertUnwindSafe(move || job.execute()))
            }
            Routine::Indexed {
                job,
                range,
                exclusive,
            } => {
                let _scope = if exclusive {
                    ExecutionScope::exclusive(state.token())
                } else {
                    ExecutionScope::batch(state.token(), range.clone())
                };
                trace!(job = state.label(), start = range.start, end = range.end, "executing batch");
                // The routine is dropped here so the last batch releases the
                // job before the handle reports completion.
                panic::catch_unwind(AssertUnwindSafe(move || {
                    for index in range {
                        job.execute(index);
                    }
                }))
            }
        };

        if let Err(payload) = outcome {
            let fault = RoutineFault::from_panic(state.label(), payload);
            on_fault(&fault);
            state.record_fault(fault);
        }
        state.unit_finished();
    }
}

/// An accepted job waiting for its dependency.
pub(crate) struct Submission {
    pub state: Arc<JobState>,
    pub tasks: Vec<Task>,
}

/// Work triggered by a job's completion.
pub(crate) enum Continuation {
    /// Hand a dependent job's tasks to the scheduler.
    Release(Submission),
    /// Count one input of a combined handle as done.
    Join(Arc<JobState>),
}

impl Continuation {
    pub fn fire(self, finished: &JobState) {
        match self {
            Continuation::Release(submission) => {
                submission.state.inherit_fault(finished);
                match submission.state.scheduler() {
                    Some(shared) => shared.release(submission, Dispatch::Ready),
                    None => submission.run_here(),
                }
            }
            Continuation::Join(join) => {
                join.inherit_fault(finished);
                join.unit_finished();
            }
        }
    }
}

impl Submission {
    /// Runs every task on the current thread; used once the scheduler is gone.
    pub fn run_here(self) {
        let Submission { state, tasks } = self;
        state.mark_running();
        if tasks.is_empty() {
            state.finish();
            return;
        }
        for task in tasks {
            task.run(|_| {});
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;

    use super::*;
    use crate::task_scheduling::job_handle::JobKind;

    struct Count(AtomicUsize);

    impl JobFor for Count {
        fn execute(&self, _index: usize) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn state(units: usize) -> Arc<JobState> {
        let state = Arc::new(JobState::new("test", JobKind::Work, Vec::new(), Weak::new()));
        state.set_remaining(units);
        state
    }

    #[test]
    fn batches_cover_the_range_once() {
        let job: Arc<dyn JobFor> = Arc::new(Count(AtomicUsize::new(0)));
        for (count, batch_size, expected) in [(10, 3, 4), (9, 3, 3), (1, 50, 1), (0, 4, 0)] {
            let state = state(0);
            let tasks = Task::batches(&job, count, batch_size, &state);
            assert_eq!(tasks.len(), expected);
            let mut covered = Vec::new();
            for task in &tasks {
                if let Routine::Indexed { range, .. } = &task.routine {
                    covered.extend(range.clone());
                }
            }
            assert_eq!(covered, (0..count).collect::<Vec<_>>());
        }
    }

    #[test]
    fn last_unit_completes_the_job() {
        let counter = Arc::new(Count(AtomicUsize::new(0)));
        let job: Arc<dyn JobFor> = counter.clone();
        let state = state(2);
        let mut tasks = Task::batches(&job, 8, 4, &state).into_iter();
        drop(job);

        tasks.next().unwrap().run(|_| {});
        assert!(!state.is_complete());
        tasks.next().unwrap().run(|_| {});
        assert!(state.is_complete());
        assert_eq!(counter.0.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn panics_become_faults() {
        struct Explode;
        impl Job for Explode {
            fn execute(&mut self) {
                panic!("exploded");
            }
        }

        let state = state(1);
        let mut seen = None;
        Task::single(Box::new(Explode), state.clone()).run(|fault| seen = Some(fault.clone()));
        assert!(state.is_complete());
        assert_eq!(seen.map(|fault| fault.message), Some("exploded".to_string()));
        assert_eq!(state.take_fault().map(|fault| fault.message), Some("exploded".to_string()));
    }
}
