//! Job-side views of a buffer.
//!
//! A view does nothing until the scheduler accepts the job that declared it.
//! From then until that job completes, the view gives the job's routine
//! direct, unlocked access to the storage, and only on a thread currently
//! executing that job.

use std::cell::Cell;
use std::ops::{Deref, DerefMut, Range};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::memory::access_tracker::DeclaredAccess;
use crate::memory::buffer::Storage;
use crate::memory::{AccessMode, BufferId};

/// Owner value of a view no in-flight job holds.
pub(crate) const UNOWNED: u64 = 0;

/// The job running on a thread and the batch it is confined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    job: u64,
    batch: Option<(usize, usize)>,
}

thread_local! {
    static CURRENT: Cell<Option<Frame>> = const { Cell::new(None) };
}

/// Marks which job runs on the current thread, and the index range it may
/// write.
///
/// Parallel batches enter a batch scope; single jobs and sequential loops run
/// exclusive. The previous scope is restored on drop so a caller that helps
/// execute work while blocked keeps its own scope.
pub(crate) struct ExecutionScope {
    previous: Option<Frame>,
}

impl ExecutionScope {
    pub fn exclusive(job: u64) -> Self {
        Self::enter(Frame { job, batch: None })
    }

    pub fn batch(job: u64, range: Range<usize>) -> Self {
        Self::enter(Frame {
            job,
            batch: Some((range.start, range.end)),
        })
    }

    fn enter(frame: Frame) -> Self {
        let previous = CURRENT.with(|current| current.replace(Some(frame)));
        Self { previous }
    }

    #[inline(always)]
    fn current() -> Option<Frame> {
        CURRENT.with(Cell::get)
    }
}

impl Drop for ExecutionScope {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(self.previous));
    }
}

/// Panics unless the job holding `owner` is running on this thread; returns
/// the batch that job is confined to here.
fn running_holder(owner: &AtomicU64, buffer: BufferId) -> Option<(usize, usize)> {
    let holder = owner.load(Ordering::Acquire);
    assert!(
        holder != UNOWNED,
        "buffer {buffer} was accessed through a view that no scheduled job declared"
    );
    match ExecutionScope::current() {
        Some(frame) if frame.job == holder => frame.batch,
        _ => panic!(
            "buffer {buffer} was accessed through a view outside the job that declared it"
        ),
    }
}

/// Shared, read-only access to a buffer from inside a job.
pub struct ReadOnly<T> {
    storage: Arc<Storage<T>>,
    owner: Arc<AtomicU64>,
}

impl<T: Copy + Send + Sync + 'static> ReadOnly<T> {
    pub(crate) fn new(storage: Arc<Storage<T>>) -> Self {
        Self {
            storage,
            owner: Arc::new(AtomicU64::new(UNOWNED)),
        }
    }

    #[inline(always)]
    pub fn buffer_id(&self) -> BufferId {
        self.storage.id()
    }

    pub(crate) fn declared(&self) -> DeclaredAccess {
        DeclaredAccess {
            buffer: self.storage.clone(),
            mode: AccessMode::ReadOnly,
            owner: self.owner.clone(),
        }
    }
}

impl<T: Copy + Send + Sync + 'static> Deref for ReadOnly<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        running_holder(&self.owner, self.storage.id());
        // The scheduler admitted no concurrent writer for the holding job.
        unsafe { self.storage.as_slice() }
    }
}

/// Exclusive read-write access to a buffer from inside a job.
///
/// Single jobs get the whole slice through `DerefMut`. Inside a parallel
/// batch only [`get`](Self::get) and [`set`](Self::set) are available, and
/// only for indices in the batch running on the current thread.
pub struct ReadWrite<T> {
    storage: Arc<Storage<T>>,
    owner: Arc<AtomicU64>,
}

impl<T: Copy + Send + Sync + 'static> ReadWrite<T> {
    pub(crate) fn new(storage: Arc<Storage<T>>) -> Self {
        Self {
            storage,
            owner: Arc::new(AtomicU64::new(UNOWNED)),
        }
    }

    #[inline(always)]
    pub fn buffer_id(&self) -> BufferId {
        self.storage.id()
    }

    pub(crate) fn declared(&self) -> DeclaredAccess {
        DeclaredAccess {
            buffer: self.storage.clone(),
            mode: AccessMode::ReadWrite,
            owner: self.owner.clone(),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.storage.len() == 0
    }

    pub fn get(&self, index: usize) -> T {
        self.ensure_index_owned(index);
        unsafe { self.storage.read(index) }
    }

    pub fn set(&self, index: usize, value: T) {
        self.ensure_index_owned(index);
        unsafe { self.storage.write(index, value) }
    }

    fn ensure_index_owned(&self, index: usize) {
        let batch = running_holder(&self.owner, self.storage.id());
        let len = self.storage.len();
        assert!(
            index < len,
            "index {index} out of range for buffer {} of length {len}",
            self.storage.id()
        );
        if let Some((start, end)) = batch {
            assert!(
                (start..end).contains(&index),
                "index {index} of buffer {} is outside batch {start}..{end}; parallel batches may only touch their own indices",
                self.storage.id()
            );
        }
    }

    fn ensure_exclusive(&self) {
        if let Some((start, end)) = running_holder(&self.owner, self.storage.id()) {
            panic!(
                "buffer {} cannot be borrowed whole inside parallel batch {start}..{end}",
                self.storage.id()
            );
        }
    }
}

impl<T: Copy + Send + Sync + 'static> Deref for ReadWrite<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.ensure_exclusive();
        unsafe { self.storage.as_slice() }
    }
}

impl<T: Copy + Send + Sync + 'static> DerefMut for ReadWrite<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.ensure_exclusive();
        unsafe { self.storage.as_mut_slice() }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::AssertUnwindSafe;

    use super::*;

    fn frame(job: u64, batch: Option<(usize, usize)>) -> Option<Frame> {
        Some(Frame { job, batch })
    }

    #[test]
    fn scopes_nest_and_restore() {
        assert_eq!(ExecutionScope::current(), None);
        {
            let _outer = ExecutionScope::batch(1, 0..10);
            assert_eq!(ExecutionScope::current(), frame(1, Some((0, 10))));
            {
                let _inner = ExecutionScope::exclusive(2);
                assert_eq!(ExecutionScope::current(), frame(2, None));
            }
            assert_eq!(ExecutionScope::current(), frame(1, Some((0, 10))));
        }
        assert_eq!(ExecutionScope::current(), None);
    }

    #[test]
    fn only_the_holding_job_passes() {
        let owner = AtomicU64::new(7);
        let buffer = BufferId(3);
        {
            let _running = ExecutionScope::batch(7, 4..8);
            assert_eq!(running_holder(&owner, buffer), Some((4, 8)));
        }
        let _other = ExecutionScope::exclusive(8);
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| running_holder(&owner, buffer)));
        assert!(outcome.is_err());
    }

    #[test]
    #[should_panic(expected = "outside the job that declared it")]
    fn held_view_is_refused_without_a_running_job() {
        let owner = AtomicU64::new(7);
        running_holder(&owner, BufferId(0));
    }
}
