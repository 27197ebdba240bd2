//! Recycling pool of buffer identifiers.
//!
//! Taking an id returns one that was previously returned, or, if none are
//! waiting, the smallest value greater than any id handed out so far.

pub(crate) struct ManagedIdPool {
    /// The next id to hand out when nothing has been returned.
    next_index: u32,
    /// Stack of returned ids.
    available_ids: Vec<u32>,
}

impl ManagedIdPool {
    #[inline(always)]
    pub fn new(initial_capacity: usize) -> Self {
        ManagedIdPool {
            next_index: 0,
            available_ids: Vec::with_capacity(initial_capacity),
        }
    }

    #[inline(always)]
    pub fn take(&mut self) -> u32 {
        match self.available_ids.pop() {
            Some(id) => id,
            None => {
                let id = self.next_index;
                self.next_index += 1;
                id
            }
        }
    }

    #[inline(always)]
    pub fn return_id(&mut self, id: u32) {
        debug_assert!(id < self.next_index, "id was never taken from this pool");
        debug_assert!(
            !self.available_ids.contains(&id),
            "id returned to the pool twice"
        );
        self.available_ids.push(id);
    }

    /// Number of ids currently held by callers.
    #[inline(always)]
    pub fn outstanding(&self) -> usize {
        self.next_index as usize - self.available_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_sequential_ids() {
        let mut pool = ManagedIdPool::new(4);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.take(), 0);
        assert_eq!(pool.take(), 1);
        assert_eq!(pool.take(), 2);
        assert_eq!(pool.outstanding(), 3);
    }

    #[test]
    fn recycles_returned_ids_last_in_first_out() {
        let mut pool = ManagedIdPool::new(4);
        let a = pool.take();
        let b = pool.take();
        pool.return_id(a);
        pool.return_id(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.take(), b);
        assert_eq!(pool.take(), a);
        assert_eq!(pool.take(), 2);
    }
}
