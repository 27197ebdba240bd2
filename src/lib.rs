//! Deferred job execution on a pool of background worker threads.
//!
//! Callers allocate typed [`Buffer`]s, build jobs that reference them through
//! [`ReadOnly`] and [`ReadWrite`] views, and hand those jobs to a
//! [`Scheduler`]. Scheduling returns a [`JobHandle`] immediately; completing the
//! handle blocks until the work (and everything it depends on) has finished,
//! helping to execute queued work in the meantime.
//!
//! Buffer access is validated when a job is submitted rather than while it
//! runs: a job that would write a buffer another in-flight job touches, without
//! a dependency ordering the two, is rejected with [`JobError::Aliasing`].
//!
//! ```no_run
//! use jobflow::{AccessDeclaration, AllocationScope, Job, JobHandle, ReadWrite, Scheduler, SchedulerConfig};
//!
//! struct AddJob {
//!     input: i32,
//!     output: ReadWrite<i32>,
//! }
//!
//! impl Job for AddJob {
//!     fn execute(&mut self) {
//!         self.output[0] = self.input + 123;
//!     }
//!
//!     fn declare_access(&self, access: &mut AccessDeclaration) {
//!         access.read_write(&self.output);
//!     }
//! }
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default())?;
//! let output = scheduler.allocate::<i32>(1, AllocationScope::Transient)?;
//! let handle = scheduler.schedule(AddJob { input: 5, output: output.read_write() }, &JobHandle::default())?;
//! handle.complete()?;
//! assert_eq!(output.get(0)?, 128);
//! output.release()?;
//! # Ok::<(), jobflow::JobError>(())
//! ```

pub mod config;
pub mod error;
pub mod memory;
pub mod task_scheduling;

pub use config::{AllocatorConfig, FaultHandler, SchedulerConfig};
pub use error::{AllocationError, JobError, Result, RoutineFault};
pub use memory::{
    AccessMode, AllocationScope, Allocator, AllocatorStats, Buffer, BufferId, CycleReport,
    Initialization, PoolStats, ReadOnly, ReadWrite,
};
pub use task_scheduling::{
    global, AccessDeclaration, Job, JobExt, JobFor, JobForExt, JobHandle, JobStatus, Scheduler,
    SchedulerMetrics,
};
