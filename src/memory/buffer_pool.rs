use std::collections::HashMap;

use crate::error::AllocationError;
use crate::memory::{AllocationScope, BufferId};

/// Largest power of two a single reservation may be rounded up to.
const MAXIMUM_SPAN_SIZE_POWER: u32 = usize::BITS - 2;

struct Reservation {
    power: u32,
    cycle: u64,
}

impl Reservation {
    #[inline(always)]
    fn bytes(&self) -> usize {
        1 << self.power
    }
}

/// Snapshot of one scope's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub live_buffers: usize,
    pub reserved_bytes: usize,
    pub capacity_bytes: usize,
}

/// Byte budget for one allocation scope.
///
/// Requests are rounded up to a power-of-two size class and counted against
/// the scope's capacity until returned.
pub(crate) struct BufferPool {
    scope: AllocationScope,
    capacity_bytes: usize,
    reserved_bytes: usize,
    outstanding: HashMap<BufferId, Reservation>,
}

impl BufferPool {
    pub fn new(scope: AllocationScope, capacity_bytes: usize) -> Self {
        Self {
            scope,
            capacity_bytes,
            reserved_bytes: 0,
            outstanding: HashMap::new(),
        }
    }

    /// Size class for a request; empty buffers still occupy the smallest class.
    #[inline]
    fn power_for(byte_count: usize) -> Option<u32> {
        let power = byte_count.max(1).checked_next_power_of_two()?.trailing_zeros();
        (power <= MAXIMUM_SPAN_SIZE_POWER).then_some(power)
    }

    pub fn take(
        &mut self,
        id: BufferId,
        byte_count: usize,
        cycle: u64,
    ) -> Result<(), AllocationError> {
        debug_assert!(!self.outstanding.contains_key(&id));
        let available = self.capacity_bytes - self.reserved_bytes;
        let exhausted = AllocationError::ScopeExhausted {
            scope: self.scope,
            requested: byte_count,
            available,
        };
        let power = Self::power_for(byte_count).ok_or_else(|| exhausted.clone())?;
        let reservation = Reservation { power, cycle };
        if reservation.bytes() > available {
            return Err(exhausted);
        }
        self.reserved_bytes += reservation.bytes();
        self.outstanding.insert(id, reservation);
        Ok(())
    }

    /// Returns a reservation; `false` if `id` held none.
    pub fn return_reservation(&mut self, id: BufferId) -> bool {
        match self.outstanding.remove(&id) {
            Some(reservation) => {
                self.reserved_bytes -= reservation.bytes();
                true
            }
            None => false,
        }
    }

    /// Live reservations made in or before `cycle`.
    pub fn live_since_or_before(&self, cycle: u64) -> Vec<BufferId> {
        let mut ids: Vec<BufferId> = self
            .outstanding
            .iter()
            .filter(|(_, reservation)| reservation.cycle <= cycle)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live_buffers: self.outstanding.len(),
            reserved_bytes: self.reserved_bytes,
            capacity_bytes: self.capacity_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_power_of_two_classes() {
        let mut pool = BufferPool::new(AllocationScope::Transient, 1 << 20);
        pool.take(BufferId(0), 20_000, 0).unwrap();
        assert_eq!(pool.stats().reserved_bytes, 32_768);
        pool.take(BufferId(1), 0, 0).unwrap();
        assert_eq!(pool.stats().reserved_bytes, 32_769);
        assert_eq!(pool.stats().live_buffers, 2);
    }

    #[test]
    fn refuses_past_capacity() {
        let mut pool = BufferPool::new(AllocationScope::Persistent, 1024);
        pool.take(BufferId(0), 1000, 0).unwrap();
        let err = pool.take(BufferId(1), 4, 0).unwrap_err();
        assert_eq!(
            err,
            AllocationError::ScopeExhausted {
                scope: AllocationScope::Persistent,
                requested: 4,
                available: 0,
            }
        );
        assert!(pool.return_reservation(BufferId(0)));
        assert!(pool.take(BufferId(1), 4, 0).is_ok());
    }

    #[test]
    fn returning_unknown_id_is_reported() {
        let mut pool = BufferPool::new(AllocationScope::Transient, 1024);
        assert!(!pool.return_reservation(BufferId(7)));
    }

    #[test]
    fn lists_reservations_by_cycle() {
        let mut pool = BufferPool::new(AllocationScope::Transient, 1 << 20);
        pool.take(BufferId(3), 8, 0).unwrap();
        pool.take(BufferId(1), 8, 1).unwrap();
        pool.take(BufferId(2), 8, 2).unwrap();
        assert_eq!(pool.live_since_or_before(1), vec![BufferId(1), BufferId(3)]);
    }
}
