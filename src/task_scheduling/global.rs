//! The process-wide scheduler.
//!
//! Created explicitly with [`init`] or lazily from the environment on first
//! use, and torn down with [`shutdown`], which drains outstanding work and
//! joins the workers. A later use creates a fresh instance.

use std::sync::Arc;

use parking_lot::{const_mutex, Mutex};
use tracing::info;

use super::job::{Job, JobFor};
use super::job_handle::JobHandle;
use super::scheduler::Scheduler;
use crate::config::SchedulerConfig;
use crate::error::{JobError, Result};
use crate::memory::{AllocationScope, Buffer};

static GLOBAL: Mutex<Option<Arc<Scheduler>>> = const_mutex(None);

/// Installs the process-wide scheduler.
///
/// Fails with [`JobError::Configuration`] if one is already running.
pub fn init(config: SchedulerConfig) -> Result<Arc<Scheduler>> {
    let mut global = GLOBAL.lock();
    if global.is_some() {
        return Err(JobError::Configuration(
            "global scheduler is already initialised".into(),
        ));
    }
    let scheduler = Arc::new(Scheduler::new(config)?);
    *global = Some(scheduler.clone());
    Ok(scheduler)
}

/// The process-wide scheduler, created from `JOBFLOW_*` variables if needed.
pub fn global() -> Result<Arc<Scheduler>> {
    let mut global = GLOBAL.lock();
    if let Some(scheduler) = global.as_ref() {
        return Ok(scheduler.clone());
    }
    let scheduler = Arc::new(Scheduler::new(SchedulerConfig::from_env())?);
    *global = Some(scheduler.clone());
    Ok(scheduler)
}

pub fn is_initialized() -> bool {
    GLOBAL.lock().is_some()
}

/// Drains and stops the process-wide scheduler. Returns `false` if none was
/// running.
pub fn shutdown() -> bool {
    let Some(scheduler) = GLOBAL.lock().take() else {
        return false;
    };
    scheduler.shutdown();
    info!("global scheduler released");
    true
}

/// Scheduling a job on the process-wide scheduler.
pub trait JobExt: Job + Sized {
    fn schedule(self, dependency: &JobHandle) -> Result<JobHandle> {
        global()?.schedule(self, dependency)
    }

    fn run(self) -> Result<()> {
        global()?.run(self)
    }
}

impl<J: Job> JobExt for J {}

/// Scheduling an indexed job on the process-wide scheduler.
pub trait JobForExt: JobFor + Sized {
    fn schedule_parallel(
        self,
        count: usize,
        batch_size: usize,
        dependency: &JobHandle,
    ) -> Result<JobHandle> {
        global()?.schedule_parallel(self, count, batch_size, dependency)
    }

    fn schedule_sequential(self, count: usize, dependency: &JobHandle) -> Result<JobHandle> {
        global()?.schedule_sequential(self, count, dependency)
    }

    fn run_for(self, count: usize) -> Result<()> {
        global()?.run_for(self, count)
    }
}

impl<J: JobFor> JobForExt for J {}

pub fn allocate_buffer<T>(length: usize, scope: AllocationScope) -> Result<Buffer<T>>
where
    T: Copy + Default + Send + Sync + 'static,
{
    global()?.allocate(length, scope)
}

pub fn release_buffer<T>(buffer: &Buffer<T>) -> Result<()>
where
    T: Copy + Default + Send + Sync + 'static,
{
    buffer.release()
}

pub fn complete(handle: &JobHandle) -> Result<()> {
    handle.complete()
}

pub fn complete_all(handles: &[JobHandle]) -> Result<()> {
    JobHandle::complete_all(handles)
}

pub fn is_complete(handle: &JobHandle) -> bool {
    handle.is_complete()
}

/// Flushes the process-wide scheduler if one is running.
pub fn flush_pending() -> usize {
    let scheduler = GLOBAL.lock().clone();
    scheduler.map_or(0, |scheduler| scheduler.flush_pending())
}
