use std::fmt;

/// Lifetime policy for a buffer's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationScope {
    /// Must be released before the end of the current work cycle.
    Transient,
    /// Lives across cycles until explicitly released.
    Persistent,
}

/// How a job declares it will touch a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Contents of freshly allocated storage.
///
/// Storage is always filled with `T::default()`; `Uninitialized` only records
/// that the caller will overwrite every element before reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Initialization {
    #[default]
    Zeroed,
    Uninitialized,
}

/// Identity of a buffer's storage, unique among live buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u32);

impl BufferId {
    #[inline(always)]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
