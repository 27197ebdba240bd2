//! Result status of a pop attempt from the task queue.

use super::task::Task;

/// Describes the result of a pop attempt.
pub(crate) enum PopTaskResult {
    /// A task was popped and must be run by the caller.
    Success(Task),
    /// The queue was empty, but may have more tasks in the future.
    Empty,
    /// The queue has been stopped and drained; workers should exit.
    Stop,
}
