use crate::memory::{AccessMode, BufferId, DeclaredAccess, ReadOnly, ReadWrite};

/// A unit of work executed once on a worker thread.
///
/// The descriptor is moved into the scheduler when scheduled, so fields it
/// mutates while executing are gone once the job completes. Results must be
/// written through a declared [`ReadWrite`] view.
pub trait Job: Send + 'static {
    fn execute(&mut self);

    /// Lists the buffer views the routine touches.
    fn declare_access(&self, _access: &mut AccessDeclaration) {}
}

/// A routine invoked once per index of `[0, count)`.
///
/// Parallel schedules split the range into batches that run concurrently;
/// inside a batch a [`ReadWrite`] view only accepts indices of that batch.
pub trait JobFor: Send + Sync + 'static {
    fn execute(&self, index: usize);

    /// Lists the buffer views the routine touches.
    fn declare_access(&self, _access: &mut AccessDeclaration) {}
}

/// Buffer accesses a job declares before it is scheduled.
#[derive(Default)]
pub struct AccessDeclaration {
    entries: Vec<DeclaredAccess>,
}

impl AccessDeclaration {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn read_only<T: Copy + Send + Sync + 'static>(&mut self, view: &ReadOnly<T>) -> &mut Self {
        self.entries.push(view.declared());
        self
    }

    pub fn read_write<T: Copy + Send + Sync + 'static>(&mut self, view: &ReadWrite<T>) -> &mut Self {
        self.entries.push(view.declared());
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declared buffers with their access modes, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (BufferId, AccessMode)> + '_ {
        self.entries
            .iter()
            .map(|entry| (entry.buffer.id(), entry.mode))
    }

    pub(crate) fn entries(&self) -> &[DeclaredAccess] {
        &self.entries
    }

    pub(crate) fn of_job<J: Job>(job: &J) -> Self {
        let mut access = Self::new();
        job.declare_access(&mut access);
        access
    }

    pub(crate) fn of_job_for<J: JobFor>(job: &J) -> Self {
        let mut access = Self::new();
        job.declare_access(&mut access);
        access
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AllocationScope, Allocator};

    struct CopyJob {
        source: ReadOnly<u32>,
        destination: ReadWrite<u32>,
    }

    impl Job for CopyJob {
        fn execute(&mut self) {
            self.destination.copy_from_slice(&self.source);
        }

        fn declare_access(&self, access: &mut AccessDeclaration) {
            access.read_only(&self.source).read_write(&self.destination);
        }
    }

    #[test]
    fn declarations_are_recorded_in_order() {
        let allocator = Allocator::default();
        let source = allocator.allocate::<u32>(4, AllocationScope::Transient).unwrap();
        let destination = allocator.allocate::<u32>(4, AllocationScope::Transient).unwrap();
        let job = CopyJob {
            source: source.read_only(),
            destination: destination.read_write(),
        };

        let access = AccessDeclaration::of_job(&job);
        assert_eq!(access.len(), 2);
        assert_eq!(
            access.iter().collect::<Vec<_>>(),
            vec![
                (source.id(), AccessMode::ReadOnly),
                (destination.id(), AccessMode::ReadWrite)
            ]
        );
        drop(job);
        source.release().unwrap();
        destination.release().unwrap();
    }
}
