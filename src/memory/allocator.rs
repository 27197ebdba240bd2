use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::AllocatorConfig;
use crate::error::{AllocationError, Result};
use crate::memory::buffer_pool::BufferPool;
use crate::memory::{AllocationScope, Buffer, BufferId, Initialization, ManagedIdPool, PoolStats};

struct AllocatorState {
    transient: BufferPool,
    persistent: BufferPool,
    ids: ManagedIdPool,
}

impl AllocatorState {
    fn pool(&mut self, scope: AllocationScope) -> &mut BufferPool {
        match scope {
            AllocationScope::Transient => &mut self.transient,
            AllocationScope::Persistent => &mut self.persistent,
        }
    }
}

/// Per-scope usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    pub cycle: u64,
    /// Buffers whose storage handle is still alive, released or not.
    pub live_ids: usize,
    pub transient: PoolStats,
    pub persistent: PoolStats,
}

/// Outcome of closing a work cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// The cycle that just ended.
    pub cycle: u64,
    /// Transient buffers that outlived it.
    pub leaked_transient: Vec<BufferId>,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.leaked_transient.is_empty()
    }
}

/// Hands out typed buffers and tracks their storage per allocation scope.
///
/// Cloning is cheap; clones share budgets and the cycle counter.
#[derive(Clone)]
pub struct Allocator {
    state: Arc<Mutex<AllocatorState>>,
    cycle: Arc<AtomicU64>,
}

impl Allocator {
    pub fn new(config: &AllocatorConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(AllocatorState {
                transient: BufferPool::new(
                    AllocationScope::Transient,
                    config.transient_capacity_bytes,
                ),
                persistent: BufferPool::new(
                    AllocationScope::Persistent,
                    config.persistent_capacity_bytes,
                ),
                ids: ManagedIdPool::new(64),
            })),
            cycle: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Allocates `length` default-initialised elements in `scope`.
    pub fn allocate<T>(&self, length: usize, scope: AllocationScope) -> Result<Buffer<T>>
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        self.allocate_with(length, scope, Initialization::Zeroed)
    }

    /// Allocates `length` elements in `scope`.
    ///
    /// `initialization` does not change the contents: storage is always
    /// filled with `T::default()`, so [`Initialization::Uninitialized`]
    /// behaves exactly like [`Initialization::Zeroed`].
    pub fn allocate_with<T>(
        &self,
        length: usize,
        scope: AllocationScope,
        _initialization: Initialization,
    ) -> Result<Buffer<T>>
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        let element_size = std::mem::size_of::<T>();
        if element_size == 0 {
            return Err(AllocationError::ZeroSizedType.into());
        }
        let byte_count = length
            .checked_mul(element_size)
            .filter(|bytes| *bytes <= isize::MAX as usize)
            .ok_or(AllocationError::SizeOverflow {
                length,
                element_size,
            })?;

        let cycle = self.cycle.load(Ordering::Acquire);
        let id = {
            let mut state = self.state.lock();
            let id = BufferId(state.ids.take());
            if let Err(err) = state.pool(scope).take(id, byte_count, cycle) {
                state.ids.return_id(id.0);
                return Err(err.into());
            }
            id
        };

        debug!(buffer = %id, length, ?scope, "allocated buffer");
        Ok(Buffer::from_storage(
            id,
            scope,
            vec![T::default(); length].into_boxed_slice(),
            self.clone(),
        ))
    }

    /// Allocates a buffer holding a copy of `values`.
    pub fn allocate_from_slice<T>(&self, values: &[T], scope: AllocationScope) -> Result<Buffer<T>>
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        let buffer = self.allocate_with(values.len(), scope, Initialization::Uninitialized)?;
        buffer.copy_from_slice(values)?;
        Ok(buffer)
    }

    /// Gives back the budget held by an explicitly released buffer.
    pub(crate) fn return_storage(&self, id: BufferId, scope: AllocationScope) {
        let returned = self.state.lock().pool(scope).return_reservation(id);
        debug_assert!(returned, "buffer {id} had no reservation to return");
    }

    /// Storage was dropped; reclaims the id and, for unreleased buffers, the budget.
    pub(crate) fn retire(&self, id: BufferId, scope: AllocationScope, released: bool) {
        let mut state = self.state.lock();
        if !released && state.pool(scope).return_reservation(id) {
            warn!(buffer = %id, ?scope, "buffer dropped without being released");
        }
        state.ids.return_id(id.0);
    }

    pub fn current_cycle(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    /// Closes the current work cycle and reports transient buffers still alive.
    pub fn end_cycle(&self) -> CycleReport {
        let state = self.state.lock();
        let cycle = self.cycle.fetch_add(1, Ordering::AcqRel);
        let leaked_transient = state.transient.live_since_or_before(cycle);
        drop(state);

        if !leaked_transient.is_empty() {
            warn!(
                cycle,
                leaked = leaked_transient.len(),
                "transient buffers outlived their work cycle"
            );
        }
        CycleReport {
            cycle,
            leaked_transient,
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        AllocatorStats {
            cycle: self.cycle.load(Ordering::Acquire),
            live_ids: state.ids.outstanding(),
            transient: state.transient.stats(),
            persistent: state.persistent.stats(),
        }
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(&AllocatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;

    fn small_allocator() -> Allocator {
        Allocator::new(&AllocatorConfig {
            transient_capacity_bytes: 1024,
            persistent_capacity_bytes: 4096,
        })
    }

    #[test]
    fn allocate_zero_initialises() {
        let allocator = Allocator::default();
        let buffer = allocator.allocate::<u64>(16, AllocationScope::Transient).unwrap();
        assert_eq!(buffer.len(), 16);
        assert_eq!(buffer.to_vec().unwrap(), vec![0; 16]);
        buffer.release().unwrap();
    }

    #[test]
    fn exhausted_scope_is_an_allocation_error() {
        let allocator = small_allocator();
        let err = allocator
            .allocate::<u32>(1024, AllocationScope::Transient)
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::Allocation(AllocationError::ScopeExhausted {
                scope: AllocationScope::Transient,
                ..
            })
        ));
        // The persistent scope has its own budget.
        let persistent = allocator
            .allocate::<u32>(1024, AllocationScope::Persistent)
            .unwrap();
        persistent.release().unwrap();
    }

    #[test]
    fn oversized_request_overflows() {
        let allocator = Allocator::default();
        let err = allocator
            .allocate::<u64>(usize::MAX / 2, AllocationScope::Persistent)
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::Allocation(AllocationError::SizeOverflow { .. })
        ));
    }

    #[test]
    fn zero_sized_elements_are_refused() {
        let allocator = Allocator::default();
        let err = allocator.allocate::<()>(4, AllocationScope::Transient).unwrap_err();
        assert!(matches!(err, JobError::Allocation(AllocationError::ZeroSizedType)));
    }

    #[test]
    fn release_returns_budget() {
        let allocator = small_allocator();
        let buffer = allocator.allocate::<u8>(1000, AllocationScope::Transient).unwrap();
        assert_eq!(allocator.stats().transient.reserved_bytes, 1024);
        buffer.release().unwrap();
        assert_eq!(allocator.stats().transient.reserved_bytes, 0);
        assert_eq!(allocator.stats().transient.live_buffers, 0);
    }

    #[test]
    fn ids_stay_claimed_until_the_handle_drops() {
        let allocator = Allocator::default();
        let buffer = allocator.allocate::<u8>(8, AllocationScope::Persistent).unwrap();
        let id = buffer.id();
        assert_eq!(allocator.stats().live_ids, 1);

        buffer.release().unwrap();
        assert_eq!(allocator.stats().persistent.live_buffers, 0);
        assert_eq!(allocator.stats().live_ids, 1);

        drop(buffer);
        assert_eq!(allocator.stats().live_ids, 0);
        let reused = allocator.allocate::<u8>(8, AllocationScope::Persistent).unwrap();
        assert_eq!(reused.id(), id);
        reused.release().unwrap();
    }

    #[test]
    fn dropping_unreleased_buffer_reclaims_budget() {
        let allocator = small_allocator();
        let buffer = allocator.allocate::<u8>(512, AllocationScope::Transient).unwrap();
        drop(buffer);
        assert_eq!(allocator.stats().transient.reserved_bytes, 0);
    }

    #[test]
    fn end_cycle_reports_live_transient_buffers() {
        let allocator = Allocator::default();
        let kept = allocator.allocate::<i32>(1, AllocationScope::Transient).unwrap();
        let released = allocator.allocate::<i32>(1, AllocationScope::Transient).unwrap();
        let persistent = allocator.allocate::<i32>(1, AllocationScope::Persistent).unwrap();
        released.release().unwrap();

        let report = allocator.end_cycle();
        assert_eq!(report.cycle, 0);
        assert_eq!(report.leaked_transient, vec![kept.id()]);
        assert_eq!(allocator.current_cycle(), 1);

        kept.release().unwrap();
        assert!(allocator.end_cycle().is_clean());
        persistent.release().unwrap();
    }

    #[test]
    fn allocate_from_slice_copies_values() {
        let allocator = Allocator::default();
        let buffer = allocator
            .allocate_from_slice(&[1, 2, 3], AllocationScope::Persistent)
            .unwrap();
        assert_eq!(buffer.to_vec().unwrap(), vec![1, 2, 3]);
        buffer.release().unwrap();
    }
}
