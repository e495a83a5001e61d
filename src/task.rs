use std::fmt;

/// Status passed to a task callback when it is invoked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task is executing on the event thread, at or after its
    /// scheduled time.
    RunReady,
    /// The task will never run; the loop is releasing it during
    /// teardown so it can free whatever it owns.
    Canceled,
}

/// A unit of work handed to the event loop.
///
/// The callback is invoked exactly once: with [`TaskStatus::RunReady`]
/// on the event thread, or with [`TaskStatus::Canceled`] while the loop
/// is being torn down.
pub struct Task {
    callback: Box<dyn FnOnce(TaskStatus) + Send>,
    /// Absolute deadline in nanoseconds on the loop's clock. Zero
    /// denotes an immediate task.
    pub(crate) scheduled_at_ns: u64,
}

impl Task {
    /// Creates a task from the given callback.
    pub fn new(callback: impl FnOnce(TaskStatus) + Send + 'static) -> Self {
        Task {
            callback: Box::new(callback),
            scheduled_at_ns: 0,
        }
    }

    /// Consumes the task, invoking its callback with `status`.
    pub(crate) fn invoke(self, status: TaskStatus) {
        (self.callback)(status);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("scheduled_at_ns", &self.scheduled_at_ns)
            .finish_non_exhaustive()
    }
}
