use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{JobError, Result};
use crate::memory::access_tracker::{AccessTracker, TrackedBuffer};
use crate::memory::{AccessMode, AllocationScope, Allocator, BufferId, ReadOnly, ReadWrite};

/// Fixed-length typed storage shared by every handle and view of one buffer.
pub(crate) struct Storage<T> {
    id: BufferId,
    scope: AllocationScope,
    length: usize,
    memory: NonNull<T>,
    tracker: Mutex<AccessTracker>,
    allocator: Allocator,
}

// Element access is serialised by the tracker for callers and by the
// submission-time aliasing check for jobs.
unsafe impl<T: Send + Sync> Send for Storage<T> {}
unsafe impl<T: Send + Sync> Sync for Storage<T> {}

impl<T> Storage<T> {
    fn new(id: BufferId, scope: AllocationScope, values: Box<[T]>, allocator: Allocator) -> Self {
        let length = values.len();
        let memory = NonNull::from(Box::leak(values)).cast::<T>();
        Self {
            id,
            scope,
            length,
            memory,
            tracker: Mutex::new(AccessTracker::new()),
            allocator,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length
    }

    /// # Safety
    /// No other thread may write the storage for the lifetime of the slice.
    #[inline(always)]
    pub unsafe fn as_slice(&self) -> &[T] {
        std::slice::from_raw_parts(self.memory.as_ptr(), self.length)
    }

    /// # Safety
    /// The caller must be the only thread touching the storage for the
    /// lifetime of the slice.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    pub unsafe fn as_mut_slice(&self) -> &mut [T] {
        std::slice::from_raw_parts_mut(self.memory.as_ptr(), self.length)
    }

    /// # Safety
    /// `index` must be in bounds and no other thread may write that element.
    #[inline(always)]
    pub unsafe fn read(&self, index: usize) -> T
    where
        T: Copy,
    {
        debug_assert!(index < self.length);
        self.memory.as_ptr().add(index).read()
    }

    /// # Safety
    /// `index` must be in bounds and no other thread may touch that element.
    #[inline(always)]
    pub unsafe fn write(&self, index: usize, value: T) {
        debug_assert!(index < self.length);
        self.memory.as_ptr().add(index).write(value)
    }

    /// # Safety
    /// Must run at most once, with no views or callers touching the storage.
    unsafe fn free(&self) {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
            self.memory.as_ptr(),
            self.length,
        )));
    }

    #[inline(always)]
    fn storage_key(&self) -> (BufferId, usize) {
        (self.id, self as *const Self as usize)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index < self.length {
            Ok(())
        } else {
            Err(JobError::Index {
                index,
                len: self.length,
            })
        }
    }
}

impl<T: Send + Sync + 'static> TrackedBuffer for Storage<T> {
    fn id(&self) -> BufferId {
        self.id
    }

    fn tracker(&self) -> &Mutex<AccessTracker> {
        &self.tracker
    }
}

impl<T> Drop for Storage<T> {
    fn drop(&mut self) {
        let released = self.tracker.get_mut().is_released();
        if !released {
            unsafe { self.free() };
        }
        self.allocator.retire(self.id, self.scope, released);
    }
}

/// Caller-side handle to a fixed-length typed buffer.
///
/// Clones share the same storage. Every access from the handle is checked
/// against in-flight jobs: reading fails while a scheduled job writes the
/// buffer, writing fails while any scheduled job touches it.
pub struct Buffer<T> {
    storage: Arc<Storage<T>>,
}

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }
}

impl<T: Copy + Default + Send + Sync + 'static> Buffer<T> {
    pub(crate) fn from_storage(
        id: BufferId,
        scope: AllocationScope,
        values: Box<[T]>,
        allocator: Allocator,
    ) -> Self {
        Self {
            storage: Arc::new(Storage::new(id, scope, values, allocator)),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> BufferId {
        self.storage.id
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.storage.length
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.storage.length == 0
    }

    #[inline(always)]
    pub fn scope(&self) -> AllocationScope {
        self.storage.scope
    }

    pub fn is_released(&self) -> bool {
        self.storage.tracker.lock().is_released()
    }

    /// Whether a scheduled job referencing this buffer has yet to complete.
    pub fn is_in_flight(&self) -> bool {
        self.storage.tracker.lock().in_flight()
    }

    fn checked(&self, mode: AccessMode) -> Result<MutexGuard<'_, AccessTracker>> {
        let mut tracker = self.storage.tracker.lock();
        tracker.check_caller(self.storage.id, mode)?;
        Ok(tracker)
    }

    pub fn get(&self, index: usize) -> Result<T> {
        let _tracker = self.checked(AccessMode::ReadOnly)?;
        self.storage.check_index(index)?;
        Ok(unsafe { self.storage.read(index) })
    }

    pub fn set(&self, index: usize, value: T) -> Result<()> {
        let _tracker = self.checked(AccessMode::ReadWrite)?;
        self.storage.check_index(index)?;
        unsafe { self.storage.write(index, value) };
        Ok(())
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        let _tracker = self.checked(AccessMode::ReadOnly)?;
        Ok(unsafe { self.storage.as_slice() }.to_vec())
    }

    /// Copies the whole buffer into `destination`, which must match its length.
    pub fn copy_to_slice(&self, destination: &mut [T]) -> Result<()> {
        let _tracker = self.checked(AccessMode::ReadOnly)?;
        if destination.len() != self.len() {
            return Err(JobError::LengthMismatch {
                expected: self.len(),
                actual: destination.len(),
            });
        }
        destination.copy_from_slice(unsafe { self.storage.as_slice() });
        Ok(())
    }

    /// Overwrites the whole buffer from `source`, which must match its length.
    pub fn copy_from_slice(&self, source: &[T]) -> Result<()> {
        let _tracker = self.checked(AccessMode::ReadWrite)?;
        if source.len() != self.len() {
            return Err(JobError::LengthMismatch {
                expected: self.len(),
                actual: source.len(),
            });
        }
        unsafe { self.storage.as_mut_slice() }.copy_from_slice(source);
        Ok(())
    }

    /// Copies the whole buffer into another buffer of the same length.
    pub fn copy_to(&self, destination: &Buffer<T>) -> Result<()> {
        if Arc::ptr_eq(&self.storage, &destination.storage) {
            let _tracker = self.checked(AccessMode::ReadWrite)?;
            return Ok(());
        }

        let source_first = self.storage.storage_key() < destination.storage.storage_key();
        let (first, second) = if source_first {
            (&self.storage, &destination.storage)
        } else {
            (&destination.storage, &self.storage)
        };
        let first_guard = first.tracker.lock();
        let second_guard = second.tracker.lock();
        let (mut source_tracker, mut destination_tracker) = if source_first {
            (first_guard, second_guard)
        } else {
            (second_guard, first_guard)
        };

        source_tracker.check_caller(self.storage.id, AccessMode::ReadOnly)?;
        destination_tracker.check_caller(destination.storage.id, AccessMode::ReadWrite)?;
        if destination.len() != self.len() {
            return Err(JobError::LengthMismatch {
                expected: self.len(),
                actual: destination.len(),
            });
        }
        unsafe {
            ptr::copy_nonoverlapping(
                self.storage.memory.as_ptr(),
                destination.storage.memory.as_ptr(),
                self.len(),
            );
        }
        Ok(())
    }

    /// Returns the storage to its allocator.
    ///
    /// Fails with [`JobError::UseAfterRelease`] if the buffer was already
    /// released or a job referencing it has not completed.
    pub fn release(&self) -> Result<()> {
        let mut tracker = self.storage.tracker.lock();
        let id = self.storage.id;
        if tracker.is_released() || tracker.in_flight() {
            return Err(JobError::UseAfterRelease { buffer: id });
        }
        tracker.mark_released();
        // Views only touch memory while an in-flight job holds them.
        unsafe { self.storage.free() };
        drop(tracker);

        self.storage.allocator.return_storage(id, self.storage.scope);
        debug!(buffer = %id, "released buffer");
        Ok(())
    }

    /// Shared access for a job; declare it with [`AccessDeclaration::read_only`](crate::AccessDeclaration::read_only).
    pub fn read_only(&self) -> ReadOnly<T> {
        ReadOnly::new(self.storage.clone())
    }

    /// Exclusive access for a job; declare it with [`AccessDeclaration::read_write`](crate::AccessDeclaration::read_write).
    pub fn read_write(&self) -> ReadWrite<T> {
        ReadWrite::new(self.storage.clone())
    }
}

impl<T> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.storage.id)
            .field("len", &self.storage.length)
            .field("scope", &self.storage.scope)
            .finish()
    }
}
