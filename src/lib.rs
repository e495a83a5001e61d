//! Single-threaded I/O event loop backed by the BSD `kqueue(2)` readiness
//! multiplexer, with a portable `poll(2)` fallback.
//!
//! An [`EventLoop`] owns one OS thread that blocks in the kernel waiting
//! for descriptor readiness, wakes on events or on a self-signal pipe,
//! dispatches readiness callbacks to subscribers, drains work submitted
//! from other threads, and runs due timer and immediate tasks.

#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![deny(unused_must_use)]

#[cfg(not(unix))]
compile_error!("kevio requires a Unix system with kqueue(2) or poll(2).");

pub mod event_loop;
pub use event_loop::{EventFlags, EventLoop, IoHandle, LoopHandle};

mod clock;
pub use clock::{Clock, MonotonicClock};

mod error;
pub use error::Error;

mod task;
pub use task::{Task, TaskStatus};

pub(crate) mod scheduler;
pub(crate) mod sys;
pub(crate) mod util;
