//! Error taxonomy shared by buffers and the scheduler.

use std::any::Any;

use thiserror::Error;

use crate::memory::{AllocationScope, BufferId};

pub type Result<T, E = JobError> = std::result::Result<T, E>;

/// Reasons a buffer allocation can be refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("{scope:?} scope exhausted: requested {requested} bytes, {available} bytes available")]
    ScopeExhausted {
        scope: AllocationScope,
        requested: usize,
        available: usize,
    },

    #[error("{length} elements of {element_size} bytes overflow the address space")]
    SizeOverflow { length: usize, element_size: usize },

    #[error("zero-sized element types cannot back a buffer")]
    ZeroSizedType,
}

/// A routine panicked while executing on a worker or an assisting caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job `{job}` faulted: {message}")]
pub struct RoutineFault {
    /// Type name of the job whose routine faulted.
    pub job: &'static str,
    /// Panic message, when the payload was a string.
    pub message: String,
}

impl RoutineFault {
    pub(crate) fn from_panic(job: &'static str, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "panic payload was not a string".to_string()
        };
        Self { job, message }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    #[error("index {index} out of range for buffer of length {len}")]
    Index { index: usize, len: usize },

    #[error("length mismatch: expected {expected} elements, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("aliasing on buffer {buffer}: {reason}")]
    Aliasing { buffer: BufferId, reason: String },

    #[error("buffer {buffer} used after release")]
    UseAfterRelease { buffer: BufferId },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    RoutineFault(#[from] RoutineFault),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_message_from_str_and_string_payloads() {
        let fault = RoutineFault::from_panic("Job", Box::new("boom"));
        assert_eq!(fault.message, "boom");

        let fault = RoutineFault::from_panic("Job", Box::new(String::from("bang")));
        assert_eq!(fault.message, "bang");

        let fault = RoutineFault::from_panic("Job", Box::new(42_u32));
        assert_eq!(fault.message, "panic payload was not a string");
    }

    #[test]
    fn routine_fault_display_is_transparent() {
        let err = JobError::from(RoutineFault {
            job: "demo::Job",
            message: "boom".into(),
        });
        assert_eq!(err.to_string(), "job `demo::Job` faulted: boom");
    }

    #[test]
    fn allocation_error_converts() {
        let err: JobError = AllocationError::ZeroSizedType.into();
        assert!(matches!(err, JobError::Allocation(AllocationError::ZeroSizedType)));
    }
}
