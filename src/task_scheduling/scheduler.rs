//! Worker pool that accepts jobs and runs them once their dependencies have
//! completed.

use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::sync::Parker;
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::job::{AccessDeclaration, Job, JobFor};
use super::job_handle::{JobHandle, JobKind, JobState};
use super::metrics::{MetricsCounters, SchedulerMetrics};
use super::pop_task_result::PopTaskResult;
use super::task::{Submission, Task};
use super::task_queue::TaskQueue;
use super::worker::{Worker, WorkerCoordinator};
use crate::config::{FaultHandler, SchedulerConfig};
use crate::error::{JobError, Result, RoutineFault};
use crate::memory::{acquire, AllocationScope, Allocator, Buffer, Initialization};

/// Longest a draining shutdown sleeps between checks for outstanding jobs.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How a job's tasks reach a thread once its dependency is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// Pending list; visible to workers after the next flush.
    Buffered,
    /// Ready queue, waking sleeping workers.
    Ready,
    /// Executed immediately on the releasing thread.
    Inline,
}

/// State shared between the scheduler, its workers and outstanding handles.
pub(crate) struct SchedulerShared {
    queue: TaskQueue,
    coordinator: WorkerCoordinator,
    metrics: MetricsCounters,
    /// Accepted work jobs that have not completed.
    in_flight: AtomicUsize,
    accepting: AtomicBool,
    flush_threshold: usize,
    idle_park_timeout: Duration,
    fault_handler: Option<FaultHandler>,
}

impl SchedulerShared {
    #[inline(always)]
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    #[inline(always)]
    pub fn coordinator(&self) -> &WorkerCoordinator {
        &self.coordinator
    }

    #[inline(always)]
    pub fn idle_park_timeout(&self) -> Duration {
        self.idle_park_timeout
    }

    pub fn execute(&self, task: Task, inline: bool) {
        self.metrics.batch_executed(inline);
        task.run(|fault| self.report_fault(fault));
    }

    fn report_fault(&self, fault: &RoutineFault) {
        self.metrics.fault();
        error!(job = fault.job, message = %fault.message, "job routine panicked");
        if let Some(handler) = &self.fault_handler {
            handler(fault);
        }
    }

    /// Hands every pending task to the workers.
    pub fn flush_pending(&self) -> usize {
        let moved = self.queue.flush();
        if moved > 0 {
            self.metrics.flushed();
            self.coordinator.wake(moved);
            debug!(tasks = moved, "flushed pending tasks");
        }
        moved
    }

    /// Makes an accepted job's tasks runnable; its dependency has completed.
    pub fn release(&self, submission: Submission, dispatch: Dispatch) {
        let Submission { state, tasks } = submission;
        state.mark_running();
        if tasks.is_empty() {
            state.finish();
            return;
        }
        match dispatch {
            Dispatch::Buffered => {
                if self.queue.push_pending(tasks) >= self.flush_threshold {
                    self.flush_pending();
                }
            }
            Dispatch::Ready => {
                let count = tasks.len();
                self.queue.push_ready(tasks);
                self.coordinator.wake(count);
            }
            Dispatch::Inline => {
                for task in tasks {
                    self.execute(task, true);
                }
            }
        }
    }

    pub fn job_completed(&self) {
        self.metrics.job_completed();
    }

    pub fn job_settled(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Runs queued work on the calling thread until `incomplete` turns false,
    /// falling back to `idle` once there is nothing left to help with.
    fn help_while(&self, incomplete: impl Fn() -> bool, idle: impl Fn(Duration)) {
        self.flush_pending();
        let backoff = Backoff::new();
        while incomplete() {
            match self.queue.try_pop() {
                PopTaskResult::Success(task) => {
                    self.execute(task, true);
                    backoff.reset();
                }
                PopTaskResult::Empty | PopTaskResult::Stop => {
                    if backoff.is_completed() {
                        self.flush_pending();
                        idle(self.idle_park_timeout);
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }
    }

    pub fn help_until_complete(&self, states: &[Arc<JobState>]) {
        let first_incomplete = || states.iter().find(|state| !state.is_complete());
        self.help_while(
            || first_incomplete().is_some(),
            |timeout| {
                if let Some(state) = first_incomplete() {
                    state.wait_timeout(timeout);
                }
            },
        );
    }
}

/// A pool of worker threads executing scheduled jobs.
///
/// Scheduling never blocks. Submitted work is buffered until it is flushed,
/// either explicitly, when the buffer reaches the configured threshold, when
/// a caller blocks on a handle, or when an idle worker polls for it.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    allocator: Allocator,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        config.log_summary();

        let parkers: Vec<Parker> = (0..config.worker_count).map(|_| Parker::new()).collect();
        let shared = Arc::new(SchedulerShared {
            queue: TaskQueue::new(),
            coordinator: WorkerCoordinator::new(
                parkers.iter().map(|parker| parker.unparker().clone()).collect(),
            ),
            metrics: MetricsCounters::default(),
            in_flight: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            flush_threshold: config.flush_threshold,
            idle_park_timeout: config.idle_park_timeout,
            fault_handler: config.fault_handler.clone(),
        });
        let scheduler = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(config.worker_count)),
            allocator: Allocator::new(&config.allocator),
        };

        for (index, parker) in parkers.into_iter().enumerate() {
            let worker = Worker::new(index, parker, scheduler.shared.clone());
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name_prefix))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => scheduler.workers.lock().push(handle),
                // Dropping the scheduler stops the workers already running.
                Err(err) => {
                    return Err(JobError::Configuration(format!(
                        "failed to spawn worker {index}: {err}"
                    )))
                }
            }
        }

        info!(workers = config.worker_count, "scheduler started");
        Ok(scheduler)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.coordinator.worker_count()
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn allocate<T>(&self, length: usize, scope: AllocationScope) -> Result<Buffer<T>>
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        self.allocator.allocate(length, scope)
    }

    /// See [`Allocator::allocate_with`]; the contents are always
    /// `T::default()` whatever `initialization` says.
    pub fn allocate_with<T>(
        &self,
        length: usize,
        scope: AllocationScope,
        initialization: Initialization,
    ) -> Result<Buffer<T>>
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        self.allocator.allocate_with(length, scope, initialization)
    }

    /// Schedules a single job to run once `dependency` has completed.
    ///
    /// Fails with [`JobError::Aliasing`] if a declared buffer is in use by an
    /// in-flight job that `dependency` does not order this job after.
    pub fn schedule<J: Job>(&self, job: J, dependency: &JobHandle) -> Result<JobHandle> {
        let access = AccessDeclaration::of_job(&job);
        let job: Box<dyn Job> = Box::new(job);
        self.submit(
            type_name::<J>(),
            &access,
            dependency,
            Dispatch::Buffered,
            move |state| vec![Task::single(job, state.clone())],
        )
    }

    /// Schedules `job` over `[0, count)` in batches of `batch_size` indices
    /// that may run concurrently.
    pub fn schedule_parallel<J: JobFor>(
        &self,
        job: J,
        count: usize,
        batch_size: usize,
        dependency: &JobHandle,
    ) -> Result<JobHandle> {
        if batch_size == 0 {
            return Err(JobError::Configuration(
                "batch_size must be at least 1".into(),
            ));
        }
        let access = AccessDeclaration::of_job_for(&job);
        let job: Arc<dyn JobFor> = Arc::new(job);
        self.submit(
            type_name::<J>(),
            &access,
            dependency,
            Dispatch::Buffered,
            move |state| Task::batches(&job, count, batch_size, state),
        )
    }

    /// Schedules `job` over `[0, count)` as one unit on a single worker.
    pub fn schedule_sequential<J: JobFor>(
        &self,
        job: J,
        count: usize,
        dependency: &JobHandle,
    ) -> Result<JobHandle> {
        let access = AccessDeclaration::of_job_for(&job);
        self.submit(
            type_name::<J>(),
            &access,
            dependency,
            Dispatch::Buffered,
            move |state| sequential_tasks(job, count, state),
        )
    }

    /// Executes a job on the calling thread after the same access checks a
    /// scheduled job gets.
    pub fn run<J: Job>(&self, job: J) -> Result<()> {
        let access = AccessDeclaration::of_job(&job);
        let job: Box<dyn Job> = Box::new(job);
        self.submit(
            type_name::<J>(),
            &access,
            &JobHandle::default(),
            Dispatch::Inline,
            move |state| vec![Task::single(job, state.clone())],
        )?
        .complete()
    }

    /// Executes `job` over `[0, count)` on the calling thread.
    pub fn run_for<J: JobFor>(&self, job: J, count: usize) -> Result<()> {
        let access = AccessDeclaration::of_job_for(&job);
        self.submit(
            type_name::<J>(),
            &access,
            &JobHandle::default(),
            Dispatch::Inline,
            move |state| sequential_tasks(job, count, state),
        )?
        .complete()
    }

    fn submit(
        &self,
        label: &'static str,
        access: &AccessDeclaration,
        dependency: &JobHandle,
        dispatch: Dispatch,
        build: impl FnOnce(&Arc<JobState>) -> Vec<Task>,
    ) -> Result<JobHandle> {
        let shared = &self.shared;
        // Counted before the check so shutdown either sees this job or
        // refuses it.
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        if !shared.accepting.load(Ordering::SeqCst) {
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(JobError::Configuration(
                "scheduler has been shut down".into(),
            ));
        }

        let dependencies = if dependency.is_complete() {
            Vec::new()
        } else {
            vec![dependency.clone()]
        };
        let state = Arc::new(JobState::new(
            label,
            JobKind::Work,
            dependencies,
            Arc::downgrade(shared),
        ));
        let handle = JobHandle::from_state(state.clone());
        if let Err(err) = acquire(access.entries(), dependency, &handle, state.token()) {
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            debug!(job = label, error = %err, "rejected job");
            return Err(err);
        }
        state.set_views(
            access
                .entries()
                .iter()
                .map(|entry| entry.owner.clone())
                .collect(),
        );

        let tasks = build(&state);
        state.set_remaining(tasks.len());
        shared.metrics.job_scheduled();
        debug!(
            job = label,
            tasks = tasks.len(),
            waits = !dependency.is_complete(),
            "scheduled job"
        );

        let submission = Submission { state, tasks };
        let submission = match dependency.state() {
            Some(predecessor) => match predecessor.defer(submission) {
                // Already complete: a fault the caller has seen stays with it.
                Some(submission) => {
                    if let Some(fault) = predecessor.unreported_fault() {
                        submission.state.record_fault(fault);
                    }
                    submission
                }
                None => return Ok(handle),
            },
            None => submission,
        };
        shared.release(submission, dispatch);
        Ok(handle)
    }

    /// Hands buffered submissions to the workers; returns how many tasks moved.
    pub fn flush_pending(&self) -> usize {
        self.shared.flush_pending()
    }

    pub fn complete(&self, handle: &JobHandle) -> Result<()> {
        handle.complete()
    }

    pub fn complete_all(&self, handles: &[JobHandle]) -> Result<()> {
        JobHandle::complete_all(handles)
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.shared.metrics.snapshot(self.shared.queue.pending_len())
    }

    pub fn is_shut_down(&self) -> bool {
        !self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Runs all outstanding work to completion, then stops and joins the
    /// workers. Later calls do nothing.
    pub fn shutdown(&self) {
        if !self.shared.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("draining outstanding jobs");
        self.shared.help_while(
            || self.shared.in_flight.load(Ordering::SeqCst) > 0,
            |timeout| thread::sleep(timeout.min(DRAIN_POLL_INTERVAL)),
        );

        self.shared.queue.request_stop();
        self.shared.coordinator.wake_all();
        let current = thread::current().id();
        for handle in std::mem::take(&mut *self.workers.lock()) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("worker thread panicked outside a job routine");
            }
        }

        let metrics = self.metrics();
        info!(
            scheduled = metrics.jobs_scheduled,
            completed = metrics.jobs_completed,
            faults = metrics.faults,
            "scheduler shut down"
        );
    }
}

fn sequential_tasks<J: JobFor>(job: J, count: usize, state: &Arc<JobState>) -> Vec<Task> {
    if count == 0 {
        return Vec::new();
    }
    vec![Task::sequential(Arc::new(job), count, state.clone())]
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.worker_count())
            .field("shut_down", &self.is_shut_down())
            .field("metrics", &self.metrics())
            .finish()
    }
}
