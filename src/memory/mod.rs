//! Typed buffers shared between the scheduling thread and job routines.
//!
//! Storage is budgeted per allocation scope by the [`Allocator`]; access from
//! jobs goes through [`ReadOnly`] and [`ReadWrite`] views whose declarations
//! are checked against in-flight jobs when the job is scheduled.

mod access_tracker;
mod allocation_scope;
mod allocator;
mod buffer;
mod buffer_pool;
mod buffer_view;
mod managed_id_pool;

pub(crate) use access_tracker::{acquire, DeclaredAccess};
pub use allocation_scope::{AccessMode, AllocationScope, BufferId, Initialization};
pub use allocator::{Allocator, AllocatorStats, CycleReport};
pub use buffer::Buffer;
pub use buffer_pool::PoolStats;
pub(crate) use buffer_view::{ExecutionScope, UNOWNED};
pub use buffer_view::{ReadOnly, ReadWrite};
pub(crate) use managed_id_pool::ManagedIdPool;
