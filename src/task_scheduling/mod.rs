//! Job scheduling on a pool of background workers.
//!
//! This module provides the pieces callers use to defer work:
//!
//! - `Job` / `JobFor`: single and indexed job descriptors
//! - `JobHandle`: completion token, dependency edge and join point
//! - `Scheduler`: worker pool with buffered submission and help-in-place waits
//! - `global`: the process-wide scheduler and its extension traits

mod job;
mod job_handle;
mod metrics;
mod pop_task_result;
mod scheduler;
mod task;
mod task_queue;
mod worker;

pub mod global;

pub use global::{JobExt, JobForExt};
pub use job::{AccessDeclaration, Job, JobFor};
pub use job_handle::{JobHandle, JobStatus};
pub use metrics::SchedulerMetrics;
pub use scheduler::Scheduler;
