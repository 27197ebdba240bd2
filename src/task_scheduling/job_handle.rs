//! Completion tokens returned by the scheduler.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::scheduler::SchedulerShared;
use super::task::{Continuation, Submission};
use crate::error::{JobError, Result, RoutineFault};
use crate::memory::UNOWNED;

/// Where a job is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Submitted; its dependency has not completed yet.
    Pending,
    /// Dependency satisfied; the routine is running or waiting for a worker.
    Running,
    Complete,
}

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETE: u8 = 2;

/// Source of job tokens; zero is reserved for views nobody holds.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(UNOWNED + 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    /// Executes a routine; counted by the scheduler until complete.
    Work,
    /// Completes once every combined handle has.
    Join,
}

/// Shared completion state behind a [`JobHandle`].
pub(crate) struct JobState {
    label: &'static str,
    /// Identifies this job to the views it holds.
    token: u64,
    kind: JobKind,
    status: AtomicU8,
    /// Units (batches, or joined handles) still to finish.
    remaining: AtomicUsize,
    /// Handles this job was ordered after; emptied on completion.
    dependencies: Mutex<Vec<JobHandle>>,
    continuations: Mutex<Vec<Continuation>>,
    finished: Condvar,
    /// Owner slots of the views this job holds; released on completion.
    views: Mutex<Vec<Arc<AtomicU64>>>,
    fault: Mutex<Option<RoutineFault>>,
    fault_reported: AtomicBool,
    scheduler: Weak<SchedulerShared>,
}

impl JobState {
    pub fn new(
        label: &'static str,
        kind: JobKind,
        dependencies: Vec<JobHandle>,
        scheduler: Weak<SchedulerShared>,
    ) -> Self {
        Self {
            label,
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            kind,
            status: AtomicU8::new(PENDING),
            remaining: AtomicUsize::new(0),
            dependencies: Mutex::new(dependencies),
            continuations: Mutex::new(Vec::new()),
            finished: Condvar::new(),
            views: Mutex::new(Vec::new()),
            fault: Mutex::new(None),
            fault_reported: AtomicBool::new(false),
            scheduler,
        }
    }

    #[inline(always)]
    pub fn label(&self) -> &'static str {
        self.label
    }

    #[inline(always)]
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn scheduler(&self) -> Option<Arc<SchedulerShared>> {
        self.scheduler.upgrade()
    }

    pub fn status(&self) -> JobStatus {
        match self.status.load(Ordering::Acquire) {
            PENDING => JobStatus::Pending,
            RUNNING => JobStatus::Running,
            _ => JobStatus::Complete,
        }
    }

    #[inline(always)]
    pub fn is_complete(&self) -> bool {
        self.status.load(Ordering::Acquire) == COMPLETE
    }

    pub fn set_remaining(&self, units: usize) {
        self.remaining.store(units, Ordering::Release);
    }

    pub fn set_views(&self, owners: Vec<Arc<AtomicU64>>) {
        *self.views.lock() = owners;
    }

    pub fn mark_running(&self) {
        let _ = self
            .status
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Keeps the first fault; later ones from other batches are dropped.
    pub fn record_fault(&self, fault: RoutineFault) {
        let mut slot = self.fault.lock();
        if slot.is_none() {
            *slot = Some(fault);
        }
    }

    pub fn fault(&self) -> Option<RoutineFault> {
        self.fault.lock().clone()
    }

    /// Copies `from`'s fault, whether or not a caller has already seen it.
    /// Used for dependents that were waiting when `from` finished.
    pub fn inherit_fault(&self, from: &JobState) {
        if let Some(fault) = from.fault() {
            self.record_fault(fault);
        }
    }

    /// Fault of a job that had already completed when a dependent was
    /// ordered after it; `None` once a caller has observed it.
    pub fn unreported_fault(&self) -> Option<RoutineFault> {
        if self.fault_reported.load(Ordering::Acquire) {
            return None;
        }
        self.fault()
    }

    /// The fault, the first time anyone asks for it.
    pub fn take_fault(&self) -> Option<RoutineFault> {
        let fault = self.fault()?;
        (!self.fault_reported.swap(true, Ordering::AcqRel)).then_some(fault)
    }

    /// Registers work to fire on completion. Hands it back if the job is
    /// already complete, in which case the caller must fire it.
    pub fn add_continuation(&self, continuation: Continuation) -> Option<Continuation> {
        let mut continuations = self.continuations.lock();
        if self.is_complete() {
            return Some(continuation);
        }
        continuations.push(continuation);
        None
    }

    /// Holds a dependent job until this one completes. Hands it back if this
    /// job already has.
    pub fn defer(&self, submission: Submission) -> Option<Submission> {
        let mut continuations = self.continuations.lock();
        if self.is_complete() {
            return Some(submission);
        }
        continuations.push(Continuation::Release(submission));
        None
    }

    /// One unit of work finished; the last one completes the job.
    pub fn unit_finished(&self) {
        let previous = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "more units finished than were scheduled");
        if previous == 1 {
            self.finish();
        }
    }

    pub fn finish(&self) {
        let shared = match self.kind {
            JobKind::Work => self.scheduler(),
            JobKind::Join => None,
        };
        if let Some(shared) = &shared {
            shared.job_completed();
        }
        for owner in self.views.lock().drain(..) {
            let _ = owner.compare_exchange(self.token, UNOWNED, Ordering::AcqRel, Ordering::Acquire);
        }
        let continuations = {
            let mut continuations = self.continuations.lock();
            self.status.store(COMPLETE, Ordering::Release);
            self.finished.notify_all();
            std::mem::take(&mut *continuations)
        };
        self.dependencies.lock().clear();

        for continuation in continuations {
            continuation.fire(self);
        }
        // Only now may a draining shutdown stop the workers.
        if let Some(shared) = shared {
            shared.job_settled();
        }
    }

    /// Blocks until complete or until `timeout` passes.
    pub fn wait_timeout(&self, timeout: Duration) {
        let mut continuations = self.continuations.lock();
        if !self.is_complete() {
            self.finished.wait_for(&mut continuations, timeout);
        }
    }

    pub fn wait(&self) {
        let mut continuations = self.continuations.lock();
        while !self.is_complete() {
            self.finished.wait(&mut continuations);
        }
    }
}

/// Opaque token for scheduled work.
///
/// The default handle stands for no work and is already complete. Clones
/// refer to the same job and compare equal.
#[derive(Clone, Default)]
pub struct JobHandle {
    state: Option<Arc<JobState>>,
}

impl JobHandle {
    pub(crate) fn from_state(state: Arc<JobState>) -> Self {
        Self { state: Some(state) }
    }

    pub(crate) fn state(&self) -> Option<&Arc<JobState>> {
        self.state.as_ref()
    }

    pub fn status(&self) -> JobStatus {
        self.state
            .as_ref()
            .map_or(JobStatus::Complete, |state| state.status())
    }

    pub fn is_complete(&self) -> bool {
        self.state.as_ref().map_or(true, |state| state.is_complete())
    }

    /// Blocks until the job and everything it depends on have completed,
    /// executing queued work on this thread while waiting.
    ///
    /// Returns the job's fault, or one inherited from a dependency, the first
    /// time it is observed. Later calls return `Ok(())`.
    pub fn complete(&self) -> Result<()> {
        Self::complete_all(std::slice::from_ref(self))
    }

    /// Blocks until every handle has completed.
    ///
    /// Reports the first unobserved fault in slice order; faults of the
    /// remaining handles stay for their own `complete` calls.
    pub fn complete_all(handles: &[JobHandle]) -> Result<()> {
        let states: Vec<Arc<JobState>> = handles
            .iter()
            .filter_map(|handle| handle.state.clone())
            .collect();
        if states.iter().any(|state| !state.is_complete()) {
            match states.iter().find_map(|state| state.scheduler()) {
                Some(shared) => shared.help_until_complete(&states),
                None => states.iter().for_each(|state| state.wait()),
            }
        }

        match states.iter().find_map(|state| state.take_fault()) {
            Some(fault) => Err(JobError::RoutineFault(fault)),
            None => Ok(()),
        }
    }

    /// A handle that completes once all of `handles` have.
    ///
    /// Scheduling against the combined handle orders a job after each input.
    pub fn combine(handles: &[JobHandle]) -> JobHandle {
        let mut inputs: Vec<JobHandle> = Vec::with_capacity(handles.len());
        for handle in handles {
            if !handle.is_complete() && !inputs.contains(handle) {
                inputs.push(handle.clone());
            }
        }
        // Completed inputs may still carry faults to pass on.
        let completed_faults: Vec<RoutineFault> = handles
            .iter()
            .filter_map(|handle| handle.state.as_ref())
            .filter(|state| state.is_complete())
            .filter_map(|state| state.unreported_fault())
            .collect();

        if inputs.len() == 1 && completed_faults.is_empty() {
            return inputs.remove(0);
        }
        if inputs.is_empty() && completed_faults.is_empty() {
            return JobHandle::default();
        }

        let scheduler = inputs
            .iter()
            .filter_map(|handle| handle.state.as_ref())
            .map(|state| state.scheduler.clone())
            .next()
            .unwrap_or_default();
        let join = Arc::new(JobState::new("join", JobKind::Join, inputs.clone(), scheduler));
        if let Some(fault) = completed_faults.into_iter().next() {
            join.record_fault(fault);
        }
        join.mark_running();
        // One extra unit keeps the join open while continuations register.
        join.set_remaining(inputs.len() + 1);
        for input in inputs.iter().filter_map(|handle| handle.state.as_ref()) {
            if let Some(continuation) = input.add_continuation(Continuation::Join(join.clone())) {
                continuation.fire(input);
            }
        }
        join.unit_finished();
        JobHandle::from_state(join)
    }

    /// Whether waiting on `self` implies `target` has completed.
    pub(crate) fn covers(&self, target: &JobHandle) -> bool {
        let Some(target) = &target.state else {
            return true;
        };
        if target.is_complete() {
            return true;
        }
        let Some(root) = &self.state else {
            return false;
        };

        let mut visited: HashSet<*const JobState> = HashSet::new();
        let mut stack = vec![root.clone()];
        while let Some(node) = stack.pop() {
            if Arc::ptr_eq(&node, target) {
                return true;
            }
            // A completed node's ancestors are all complete.
            if node.is_complete() || !visited.insert(Arc::as_ptr(&node)) {
                continue;
            }
            stack.extend(
                node.dependencies
                    .lock()
                    .iter()
                    .filter_map(|handle| handle.state.clone()),
            );
        }
        target.is_complete()
    }
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &Self) -> bool {
        match (&self.state, &other.state) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for JobHandle {}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            Some(state) => f
                .debug_struct("JobHandle")
                .field("job", &state.label)
                .field("status", &state.status())
                .finish(),
            None => f.write_str("JobHandle(empty)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work(label: &'static str, dependencies: Vec<JobHandle>) -> Arc<JobState> {
        let state = Arc::new(JobState::new(label, JobKind::Work, dependencies, Weak::new()));
        state.set_remaining(1);
        state
    }

    #[test]
    fn default_handle_is_complete() {
        let handle = JobHandle::default();
        assert!(handle.is_complete());
        assert_eq!(handle.status(), JobStatus::Complete);
        assert_eq!(handle.complete(), Ok(()));
        assert_eq!(handle, JobHandle::default());
    }

    #[test]
    fn status_moves_forward_only() {
        let state = work("a", Vec::new());
        let handle = JobHandle::from_state(state.clone());
        assert_eq!(handle.status(), JobStatus::Pending);
        state.mark_running();
        assert_eq!(handle.status(), JobStatus::Running);
        state.unit_finished();
        assert_eq!(handle.status(), JobStatus::Complete);
        state.mark_running();
        assert_eq!(handle.status(), JobStatus::Complete);
    }

    #[test]
    fn covers_follows_the_dependency_chain() {
        let first = JobHandle::from_state(work("first", Vec::new()));
        let second = JobHandle::from_state(work("second", vec![first.clone()]));
        let unrelated = JobHandle::from_state(work("unrelated", Vec::new()));

        assert!(second.covers(&first));
        assert!(second.covers(&second));
        assert!(!first.covers(&second));
        assert!(!second.covers(&unrelated));
        assert!(!JobHandle::default().covers(&first));
        assert!(first.covers(&JobHandle::default()));

        unrelated.state().unwrap().unit_finished();
        assert!(second.covers(&unrelated));
    }

    #[test]
    fn combine_waits_for_every_input() {
        let a = work("a", Vec::new());
        let b = work("b", Vec::new());
        let joined = JobHandle::combine(&[
            JobHandle::from_state(a.clone()),
            JobHandle::from_state(b.clone()),
            JobHandle::default(),
        ]);
        assert!(!joined.is_complete());
        assert!(joined.covers(&JobHandle::from_state(a.clone())));
        assert!(joined.covers(&JobHandle::from_state(b.clone())));

        a.unit_finished();
        assert!(!joined.is_complete());
        b.unit_finished();
        assert!(joined.is_complete());
        assert_eq!(joined.complete(), Ok(()));
    }

    #[test]
    fn combine_of_one_or_none_needs_no_join() {
        let a = JobHandle::from_state(work("a", Vec::new()));
        assert_eq!(JobHandle::combine(&[a.clone(), a.clone()]), a);
        assert_eq!(JobHandle::combine(&[]), JobHandle::default());
    }

    #[test]
    fn fault_is_reported_once_and_inherited() {
        let failing = work("failing", Vec::new());
        let handle = JobHandle::from_state(failing.clone());
        let other = JobHandle::from_state(work("other", Vec::new()));
        let joined = JobHandle::combine(&[handle.clone(), other.clone()]);

        failing.record_fault(RoutineFault {
            job: "failing",
            message: "boom".into(),
        });
        failing.unit_finished();
        other.state().unwrap().unit_finished();

        assert!(matches!(handle.complete(), Err(JobError::RoutineFault(_))));
        assert_eq!(handle.complete(), Ok(()));
        // The join inherited its own copy.
        assert!(matches!(joined.complete(), Err(JobError::RoutineFault(_))));
        assert_eq!(joined.complete(), Ok(()));
    }

    #[test]
    fn observed_fault_is_not_passed_to_later_joins() {
        let failing = work("failing", Vec::new());
        let handle = JobHandle::from_state(failing.clone());
        failing.record_fault(RoutineFault {
            job: "failing",
            message: "boom".into(),
        });
        failing.unit_finished();

        // Combined before anyone looked: the join carries it.
        let early = JobHandle::combine(&[handle.clone(), JobHandle::default()]);
        assert!(matches!(handle.complete(), Err(JobError::RoutineFault(_))));
        assert!(matches!(early.complete(), Err(JobError::RoutineFault(_))));

        // Combined after it was reported: nothing left to pass on.
        let late = JobHandle::combine(&[handle.clone(), JobHandle::default()]);
        assert_eq!(late, JobHandle::default());
        assert_eq!(late.complete(), Ok(()));
    }

    #[test]
    fn wait_returns_once_finished_elsewhere() {
        let state = work("threaded", Vec::new());
        let handle = JobHandle::from_state(state.clone());
        let finisher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            state.unit_finished();
        });
        handle.complete().unwrap();
        assert!(handle.is_complete());
        finisher.join().unwrap();
    }
}
