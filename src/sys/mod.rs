//! Kernel readiness interfaces.
//!
//! The event loop is written against the [`Multiplexer`] trait. The
//! primary implementation wraps `kqueue(2)`; hosts without it fall back
//! to a `poll(2)` selector with the same per-filter event shape.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub(crate) mod pipe;

// Gated to the platforms whose kqueue supports receipt-mode
// submissions.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub(crate) mod kqueue;

pub(crate) mod poll;

/// Creates the preferred readiness selector for this platform.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub(crate) fn default_selector() -> io::Result<Box<dyn Multiplexer>> {
    Ok(Box::new(kqueue::Selector::new()?))
}

/// Creates the preferred readiness selector for this platform.
#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
pub(crate) fn default_selector() -> io::Result<Box<dyn Multiplexer>> {
    Ok(Box::new(poll::Selector::new()?))
}

/// A kind of readiness the kernel can report for a descriptor.
///
/// Read and write are registered and deregistered independently; a
/// handle watching both holds two kernel registrations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Filter {
    /// Readiness to read.
    Read,
    /// Readiness to write.
    Write,
}

/// One registration to submit to a selector.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Change {
    pub(crate) fd: RawFd,
    pub(crate) filter: Filter,
    /// Opaque token attached to the registration and echoed back on
    /// every event it produces.
    pub(crate) token: usize,
}

/// Per-change outcome of a receipt-mode submission.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Receipt {
    pub(crate) fd: RawFd,
    pub(crate) filter: Filter,
    /// Raw OS error for this change; zero when it was applied.
    pub(crate) error: i32,
}

impl Receipt {
    /// Whether the change was applied.
    pub(crate) fn is_ok(&self) -> bool {
        self.error == 0
    }
}

/// A readiness event reported by a selector.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Event {
    pub(crate) fd: RawFd,
    pub(crate) filter: Filter,
    /// Filter-specific payload. For read and write filters, the number
    /// of bytes transferable without blocking; a selector without byte
    /// counts reports 1 when ready and 0 otherwise.
    pub(crate) payload: i64,
    /// The peer side of the descriptor has shut down.
    pub(crate) eof: bool,
    /// The kernel flagged this event as an error report.
    pub(crate) error: bool,
    /// Token supplied with the registration.
    pub(crate) token: usize,
}

/// Readiness multiplexer: register, deregister, wait.
///
/// Implementations report one event per `(descriptor, filter)` pair.
/// Folding read and write readiness of one handle into a single
/// callback is the event loop's job, not the selector's.
pub(crate) trait Multiplexer: Send {
    /// Submits `changes` in receipt mode: the result reports per-change
    /// success or failure instead of delivering events, in submission
    /// order. Re-adding an existing `(fd, filter)` pair replaces it.
    fn add_with_receipt(&mut self, changes: &[Change]) -> io::Result<Vec<Receipt>>;

    /// Removes one `(fd, filter)` registration.
    fn delete(&mut self, fd: RawFd, filter: Filter) -> io::Result<()>;

    /// Blocks until events arrive or `timeout` expires. `events` is
    /// cleared and refilled; the stored count is returned.
    fn wait(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<usize>;
}

/// Creates an `io::Error` with a message prefixed to the `errno` value.
macro_rules! errno {
    ($($arg:tt)+) => {{
        let errno = ::std::io::Error::last_os_error();
        let prefix = format!($($arg)+);
        ::std::io::Error::new(errno.kind(), format!("{prefix}: {errno}"))
    }};
}

pub(crate) use errno;
