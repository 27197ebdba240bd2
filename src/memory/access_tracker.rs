//! Submission-time aliasing checks.
//!
//! Every buffer remembers the last in-flight job that writes it and the
//! in-flight jobs that read it since. A new job may only touch the buffer if
//! its dependency handle already orders it after each conflicting job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{JobError, Result};
use crate::memory::buffer_view::UNOWNED;
use crate::memory::{AccessMode, BufferId};
use crate::task_scheduling::JobHandle;

pub(crate) struct AccessTracker {
    released: bool,
    writer: Option<JobHandle>,
    readers: Vec<JobHandle>,
}

impl AccessTracker {
    pub fn new() -> Self {
        Self {
            released: false,
            writer: None,
            readers: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn mark_released(&mut self) {
        self.released = true;
        self.writer = None;
        self.readers.clear();
    }

    fn prune(&mut self) {
        if self.writer.as_ref().is_some_and(JobHandle::is_complete) {
            self.writer = None;
        }
        self.readers.retain(|reader| !reader.is_complete());
    }

    /// Whether any job referencing the buffer has yet to complete.
    pub fn in_flight(&mut self) -> bool {
        self.prune();
        self.writer.is_some() || !self.readers.is_empty()
    }

    /// Validates an access from the thread that owns the buffer handle.
    pub fn check_caller(&mut self, buffer: BufferId, mode: AccessMode) -> Result<()> {
        if self.released {
            return Err(JobError::UseAfterRelease { buffer });
        }
        self.prune();
        if self.writer.is_some() {
            return Err(JobError::Aliasing {
                buffer,
                reason: "a scheduled job still writes it; complete that job first".into(),
            });
        }
        if mode == AccessMode::ReadWrite && !self.readers.is_empty() {
            return Err(JobError::Aliasing {
                buffer,
                reason: "scheduled jobs still read it; complete them first".into(),
            });
        }
        Ok(())
    }

    fn check_job(&mut self, buffer: BufferId, mode: AccessMode, dependency: &JobHandle) -> Result<()> {
        if self.released {
            return Err(JobError::UseAfterRelease { buffer });
        }
        self.prune();
        let uncovered = |job: &JobHandle| !dependency.covers(job);
        if self.writer.as_ref().is_some_and(uncovered) {
            return Err(JobError::Aliasing {
                buffer,
                reason: "an in-flight job writes it and the dependency does not order after that job"
                    .into(),
            });
        }
        if mode == AccessMode::ReadWrite && self.readers.iter().any(uncovered) {
            return Err(JobError::Aliasing {
                buffer,
                reason: "an in-flight job reads it and the dependency does not order after that job"
                    .into(),
            });
        }
        Ok(())
    }

    fn register(&mut self, mode: AccessMode, job: &JobHandle) {
        match mode {
            AccessMode::ReadOnly => self.readers.push(job.clone()),
            AccessMode::ReadWrite => {
                self.writer = Some(job.clone());
                self.readers.clear();
            }
        }
    }
}

/// Type-erased view of a buffer's storage, for checks that span element types.
pub(crate) trait TrackedBuffer: Send + Sync {
    fn id(&self) -> BufferId;
    fn tracker(&self) -> &Mutex<AccessTracker>;
}

/// One buffer a job declared, with the owner slot of the view declaring it.
pub(crate) struct DeclaredAccess {
    pub buffer: Arc<dyn TrackedBuffer>,
    pub mode: AccessMode,
    pub owner: Arc<AtomicU64>,
}

impl DeclaredAccess {
    #[inline(always)]
    fn storage_key(&self) -> (BufferId, usize) {
        (
            self.buffer.id(),
            Arc::as_ptr(&self.buffer) as *const () as usize,
        )
    }
}

/// Validates `declared` for a job ordered after `dependency` and, if nothing
/// conflicts, records `job` as holding those accesses and hands the views to
/// `owner`.
///
/// A view belongs to at most one in-flight job. Trackers are locked in
/// storage order so concurrent submissions cannot deadlock or interleave
/// their check and registration.
pub(crate) fn acquire(
    declared: &[DeclaredAccess],
    dependency: &JobHandle,
    job: &JobHandle,
    owner: u64,
) -> Result<()> {
    let mut order: Vec<&DeclaredAccess> = declared.iter().collect();
    order.sort_by_key(|access| access.storage_key());

    let mut merged: Vec<(&DeclaredAccess, AccessMode)> = Vec::with_capacity(order.len());
    for access in order {
        match merged.last_mut() {
            Some((previous, mode)) if previous.storage_key() == access.storage_key() => {
                if *mode == AccessMode::ReadWrite || access.mode == AccessMode::ReadWrite {
                    return Err(JobError::Aliasing {
                        buffer: access.buffer.id(),
                        reason: "declared more than once by the same job with write access".into(),
                    });
                }
            }
            _ => merged.push((access, access.mode)),
        }
    }

    let mut guards: Vec<MutexGuard<'_, AccessTracker>> = merged
        .iter()
        .map(|(access, _)| access.buffer.tracker().lock())
        .collect();

    for ((access, mode), tracker) in merged.iter().zip(guards.iter_mut()) {
        tracker.check_job(access.buffer.id(), *mode, dependency)?;
    }
    if let Some(access) = declared
        .iter()
        .find(|access| access.owner.load(Ordering::Acquire) != UNOWNED)
    {
        return Err(JobError::Aliasing {
            buffer: access.buffer.id(),
            reason: "the view is already held by another in-flight job".into(),
        });
    }
    for ((_, mode), tracker) in merged.iter().zip(guards.iter_mut()) {
        tracker.register(*mode, job);
    }
    for access in declared {
        access.owner.store(owner, Ordering::Release);
    }
    drop(guards);
    Ok(())
}
