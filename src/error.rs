use std::io;

use thiserror::Error;

/// Errors reported by event loop operations.
///
/// Only failures that can be returned synchronously appear here. A
/// registration that fails on the event thread is delivered through the
/// subscriber's own callback with [`EventFlags::ERROR`] instead.
///
/// [`EventFlags::ERROR`]: crate::EventFlags::ERROR
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// `run` was called while the loop was not ready to run. Stop the
    /// loop and wait for completion before running it again.
    #[error("event loop is already running")]
    AlreadyRunning,

    /// The event thread could not be spawned. The loop is restored to a
    /// runnable state.
    #[error("failed to spawn event thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    /// The event thread could not be joined.
    #[error("failed to join event thread")]
    ThreadJoin,

    /// A kernel interface call failed.
    #[error("system call failed: {0}")]
    SystemCall(#[from] io::Error),
}
