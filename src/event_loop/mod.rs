//! Single-threaded I/O event loop.
//!
//! Each loop owns exactly one OS thread. That thread blocks in the
//! kernel readiness multiplexer, wakes when a subscribed descriptor
//! becomes ready or when another thread signals it through a pipe, and
//! then dispatches readiness callbacks, drains cross-thread work, and
//! runs due scheduled tasks. Every I/O and task callback runs on the
//! event thread, so subscribers never need their own locking.
//!
//! Data is partitioned into two regions. The cross-thread inbox (task
//! queue, lifecycle state, signal flag) lives behind a mutex and is the
//! only shared-mutable state. Everything else, from the selector and
//! scheduler to the subscription records, is private to the event
//! thread.
//! Registration changes are serialized onto the event thread as
//! immediate tasks, which is what lets a two-filter subscription take
//! effect atomically: a half-installed pair can be rolled back before
//! any of its events are dispatched.

mod events;
mod subscription;

mod event_thread;

#[cfg(test)]
mod tests;

pub use events::EventFlags;
pub use subscription::IoHandle;

pub(crate) use events::event_flags_from;

use subscription::{run_subscribe, run_unsubscribe, RecordPtr, SubscriptionRecord};

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{fmt, io, mem, ptr, thread};

use crate::clock::{Clock, MonotonicClock};
use crate::error::Error;
use crate::scheduler::Scheduler;
use crate::sys::{self, pipe::SignalPipe, Multiplexer};
use crate::task::{Task, TaskStatus};

/// Max kernel wait per loop iteration.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(100);

thread_local! {
    /// Address of the loop whose event thread is the current thread;
    /// zero everywhere else. Lets callbacks ask "am I on the event
    /// thread?" without touching shared state.
    static ACTIVE_LOOP: Cell<usize> = const { Cell::new(0) };
}

/// Lifecycle of the event thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum LoopState {
    /// Not yet running; `run` may start the thread.
    Ready,
    /// The event thread is executing the main loop.
    Running,
    /// Stop requested; the thread exits at its next loop test.
    Stopping,
}

/// Cross-thread staging area.
///
/// Every mutation happens under the mutex. Whoever finds
/// `thread_signaled` clear sets it and writes one byte to the signal
/// pipe after unlocking; the event thread clears the flag inside the
/// critical section where it swaps the task list out.
#[derive(Debug)]
pub(crate) struct Inbox {
    pub(crate) thread_signaled: bool,
    pub(crate) pending_tasks: VecDeque<Task>,
    pub(crate) state: LoopState,
}

/// State owned by the event thread.
///
/// While the thread runs nothing else may touch this; once the thread
/// is known-joined (lifecycle `Ready`), the facade may.
pub(crate) struct ThreadData {
    pub(crate) selector: RefCell<Box<dyn Multiplexer>>,
    pub(crate) scheduler: Scheduler,
    /// Signed so an unsubscribe task overtaking its subscribe task (the
    /// pair may arrive through different paths) dips below zero instead
    /// of wrapping; the pair always nets out.
    pub(crate) connected_handle_count: Cell<i64>,
    /// Mirror of the inbox lifecycle state, read by the main-loop
    /// termination test without taking the mutex. Updated from the
    /// inbox copy only while the mutex is held.
    pub(crate) state: Cell<LoopState>,
}

pub(crate) struct Inner {
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) signal_pipe: SignalPipe,
    pub(crate) inbox: Mutex<Inbox>,
    thread_data: UnsafeCell<ThreadData>,
}

// SAFETY: `thread_data` is the one field `Sync` cannot see through.
// Access to it is serialized by the lifecycle protocol: the event
// thread touches it while the loop runs, and the facade touches it only
// before `run` or after `wait_for_stop_completion` has joined the
// thread.
unsafe impl Sync for Inner {}

impl Inner {
    /// Thread-private region.
    ///
    /// # Safety
    ///
    /// The caller must either be on the event thread, or know the
    /// thread is not running (lifecycle `Ready`, pre-run or post-join).
    pub(crate) unsafe fn thread_data(&self) -> &ThreadData {
        // SAFETY: the caller upholds the access protocol above; the
        // interior `Cell`/`RefCell` fields serialize same-thread
        // re-entrancy.
        unsafe { &*self.thread_data.get() }
    }

    /// Enqueues `task` and wakes the event thread if nobody has since
    /// it last drained.
    fn push_to_inbox(&self, task: Task) {
        let signal_needed = {
            let mut inbox = self.inbox.lock().unwrap();
            inbox.pending_tasks.push_back(task);

            let needed = !inbox.thread_signaled;
            inbox.thread_signaled = true;
            needed
        };

        // The write happens outside the critical section. If the pipe
        // is full, a previous write already guarantees a wake.
        if signal_needed {
            self.signal_pipe.signal();
        }
    }
}

/// A single-threaded I/O event loop.
///
/// The `EventLoop` value itself stays with whichever thread manages the
/// lifecycle ([`run`], [`stop`], [`wait_for_stop_completion`]); clone a
/// [`LoopHandle`] for everything other threads and callbacks need.
///
/// Dropping the loop stops it, joins the event thread, and invokes
/// every task that never got to run with [`TaskStatus::Canceled`] so
/// callers can release whatever those tasks own.
///
/// ```
/// use std::sync::mpsc;
///
/// use kevio::{EventLoop, Task};
///
/// let mut event_loop = EventLoop::new().unwrap();
/// event_loop.run().unwrap();
///
/// let (tx, rx) = mpsc::channel();
/// event_loop.schedule_task_now(Task::new(move |_| {
///     tx.send("hello").unwrap();
/// }));
///
/// assert_eq!(rx.recv().unwrap(), "hello");
///
/// event_loop.stop();
/// event_loop.wait_for_stop_completion().unwrap();
/// ```
///
/// [`run`]: EventLoop::run
/// [`stop`]: EventLoop::stop
/// [`wait_for_stop_completion`]: EventLoop::wait_for_stop_completion
pub struct EventLoop {
    handle: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Creates a loop over the platform's preferred selector and the
    /// default monotonic clock. The loop does nothing until [`run`].
    ///
    /// [`run`]: EventLoop::run
    pub fn new() -> Result<EventLoop, Error> {
        EventLoop::with_parts(sys::default_selector()?, Box::new(MonotonicClock::new()))
    }

    /// Creates a loop over an explicit selector and clock.
    pub(crate) fn with_parts(
        mut selector: Box<dyn Multiplexer>,
        clock: Box<dyn Clock>,
    ) -> Result<EventLoop, Error> {
        let signal_pipe = SignalPipe::open()?;

        // The signal pipe's read end is registered before anything else
        // can run; a wake must never be lost.
        let changes = [sys::Change {
            fd: signal_pipe.read_fd(),
            filter: sys::Filter::Read,
            token: 0,
        }];
        let receipts = selector.add_with_receipt(&changes)?;
        if let Some(failed) = receipts.iter().find(|receipt| !receipt.is_ok()) {
            return Err(Error::SystemCall(io::Error::from_raw_os_error(
                failed.error,
            )));
        }

        let inner = Arc::new(Inner {
            clock,
            signal_pipe,
            inbox: Mutex::new(Inbox {
                thread_signaled: false,
                pending_tasks: VecDeque::new(),
                state: LoopState::Ready,
            }),
            thread_data: UnsafeCell::new(ThreadData {
                selector: RefCell::new(selector),
                scheduler: Scheduler::new(),
                connected_handle_count: Cell::new(0),
                state: Cell::new(LoopState::Ready),
            }),
        });

        Ok(EventLoop {
            handle: LoopHandle { inner },
            thread: None,
        })
    }

    /// A clonable handle for use from other threads and from callbacks.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Starts the event thread.
    ///
    /// Fails with [`Error::AlreadyRunning`] unless the loop is ready to
    /// run; a loop that has been stopped becomes ready again once
    /// [`wait_for_stop_completion`] returns. A spawn failure restores
    /// the ready state.
    ///
    /// [`wait_for_stop_completion`]: EventLoop::wait_for_stop_completion
    pub fn run(&mut self) -> Result<(), Error> {
        let inner = &self.handle.inner;

        {
            let mut inbox = inner.inbox.lock().unwrap();
            if inbox.state != LoopState::Ready {
                return Err(Error::AlreadyRunning);
            }

            // SAFETY: lifecycle is `Ready`; the thread is known-joined.
            let thread_data = unsafe { inner.thread_data() };
            debug_assert_eq!(thread_data.state.get(), LoopState::Ready);

            // Both copies flip before the spawn so the thread starts
            // with a consistent view.
            inbox.state = LoopState::Running;
            thread_data.state.set(LoopState::Running);
        }

        let thread_inner = Arc::clone(inner);
        let spawned = thread::Builder::new()
            .name("kevio-event-loop".into())
            .spawn(move || event_thread::run(thread_inner));

        match spawned {
            Ok(join) => {
                self.thread = Some(join);
                Ok(())
            }
            Err(err) => {
                let mut inbox = inner.inbox.lock().unwrap();
                inbox.state = LoopState::Ready;
                // SAFETY: the spawn failed; no thread is running.
                unsafe { inner.thread_data() }.state.set(LoopState::Ready);
                Err(Error::ThreadSpawn(err))
            }
        }
    }

    /// Requests termination; see [`LoopHandle::stop`].
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Joins the event thread and resets the loop so it can run again.
    ///
    /// Call [`stop`] first, or this blocks until something else stops
    /// the loop.
    ///
    /// [`stop`]: EventLoop::stop
    pub fn wait_for_stop_completion(&mut self) -> Result<(), Error> {
        if let Some(join) = self.thread.take() {
            join.join().map_err(|_| Error::ThreadJoin)?;
        }

        let inner = &self.handle.inner;
        let mut inbox = inner.inbox.lock().unwrap();
        inbox.state = LoopState::Ready;
        // SAFETY: the thread has been joined.
        unsafe { inner.thread_data() }.state.set(LoopState::Ready);

        Ok(())
    }

    /// Schedules `task` on the event thread; see
    /// [`LoopHandle::schedule_task_now`].
    pub fn schedule_task_now(&self, task: Task) {
        self.handle.schedule_task_now(task);
    }

    /// Schedules `task` for a future time; see
    /// [`LoopHandle::schedule_task_future`].
    pub fn schedule_task_future(&self, task: Task, run_at_ns: u64) {
        self.handle.schedule_task_future(task, run_at_ns);
    }

    /// Subscribes a descriptor for readiness callbacks; see
    /// [`LoopHandle::subscribe_to_io_events`].
    pub fn subscribe_to_io_events<F>(&self, handle: &Arc<IoHandle>, events: EventFlags, on_event: F)
    where
        F: FnMut(&IoHandle, EventFlags) + Send + 'static,
    {
        self.handle.subscribe_to_io_events(handle, events, on_event);
    }

    /// Removes a subscription; see
    /// [`LoopHandle::unsubscribe_from_io_events`].
    pub fn unsubscribe_from_io_events(&self, handle: &IoHandle) {
        self.handle.unsubscribe_from_io_events(handle);
    }

    /// Whether the calling thread is this loop's event thread.
    pub fn is_on_event_thread(&self) -> bool {
        self.handle.is_on_event_thread()
    }

    /// Current time on the loop's clock; see [`LoopHandle::now_ns`].
    pub fn now_ns(&self) -> io::Result<u64> {
        self.handle.now_ns()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
        if self.wait_for_stop_completion().is_err() {
            // A thread that cannot be joined leaves the private region
            // unsafe to touch; leak rather than race.
            log::warn!("leaking event loop state: event thread could not be joined");
            return;
        }

        // SAFETY: the thread is joined; teardown owns the private
        // region.
        let thread_data = unsafe { self.handle.inner.thread_data() };

        // Scheduler tasks are cancelled first. A cancelled task may
        // schedule follow-up work, which from this thread lands in the
        // inbox, so the inbox drains last, until it stays empty.
        thread_data.scheduler.cancel_all();

        loop {
            let pending = mem::take(&mut self.handle.inner.inbox.lock().unwrap().pending_tasks);
            if pending.is_empty() {
                break;
            }
            for task in pending {
                task.invoke(TaskStatus::Canceled);
            }
        }

        debug_assert_eq!(
            thread_data.connected_handle_count.get(),
            0,
            "event loop destroyed with live subscriptions; their records leak"
        );
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

/// Clonable, thread-safe handle to an [`EventLoop`].
///
/// Everything a callback or another thread may need (scheduling tasks,
/// subscribing descriptors, requesting a stop) goes through a handle.
/// Handles stay valid for as long as any of them exist, but work
/// submitted after the loop stopped only runs (as cancelled) when the
/// `EventLoop` value is dropped.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Arc<Inner>,
}

impl LoopHandle {
    /// Whether the calling thread is this loop's event thread.
    ///
    /// True inside any callback the loop invokes, false everywhere
    /// else.
    pub fn is_on_event_thread(&self) -> bool {
        ACTIVE_LOOP.with(|active| active.get()) == Arc::as_ptr(&self.inner) as usize
    }

    /// Current time in nanoseconds on the loop's clock, for computing
    /// absolute deadlines.
    pub fn now_ns(&self) -> io::Result<u64> {
        self.inner.clock.now_ns()
    }

    /// Schedules `task` to run on the event thread as soon as possible.
    ///
    /// Tasks submitted from one thread run in submission order.
    pub fn schedule_task_now(&self, task: Task) {
        self.schedule_task(task, 0);
    }

    /// Schedules `task` to run on the event thread at or after
    /// `run_at_ns`, an absolute time on the loop's clock (see
    /// [`now_ns`]). Zero means "as soon as possible".
    ///
    /// [`now_ns`]: LoopHandle::now_ns
    pub fn schedule_task_future(&self, task: Task, run_at_ns: u64) {
        self.schedule_task(task, run_at_ns);
    }

    fn schedule_task(&self, mut task: Task, run_at_ns: u64) {
        // On the event thread the inbox can be bypassed: this thread
        // cannot simultaneously be draining the inbox and running here.
        if self.is_on_event_thread() {
            // SAFETY: we are on the event thread.
            let thread_data = unsafe { self.inner.thread_data() };
            if run_at_ns == 0 {
                thread_data.scheduler.schedule_now(task);
            } else {
                thread_data.scheduler.schedule_future(task, run_at_ns);
            }
            return;
        }

        task.scheduled_at_ns = run_at_ns;
        self.inner.push_to_inbox(task);
    }

    /// Requests loop termination.
    ///
    /// Idempotent, non-blocking, and a no-op unless the loop is
    /// running. When this returns the thread may still be mid-iteration;
    /// [`EventLoop::wait_for_stop_completion`] observes the actual
    /// exit.
    pub fn stop(&self) {
        let signal_needed = {
            let mut inbox = self.inner.inbox.lock().unwrap();
            if inbox.state == LoopState::Running {
                inbox.state = LoopState::Stopping;

                let needed = !inbox.thread_signaled;
                inbox.thread_signaled = true;
                needed
            } else {
                false
            }
        };

        if signal_needed {
            self.inner.signal_pipe.signal();
        }
    }

    /// Subscribes `handle` for readiness callbacks.
    ///
    /// `events` selects [`EventFlags::READABLE`], [`EventFlags::WRITABLE`],
    /// or both. The registration itself is performed by a task on the
    /// event thread; if it fails there, `on_event` is invoked exactly
    /// once with [`EventFlags::ERROR`] and the handle must still be
    /// unsubscribed. Callbacks run on the event thread and must not
    /// block it.
    ///
    /// # Panics
    ///
    /// Panics if `events` selects neither filter, if the descriptor is
    /// negative, or if `handle` is already subscribed.
    pub fn subscribe_to_io_events<F>(&self, handle: &Arc<IoHandle>, events: EventFlags, on_event: F)
    where
        F: FnMut(&IoHandle, EventFlags) + Send + 'static,
    {
        assert!(handle.fd() >= 0, "subscribe requires a valid descriptor");
        assert!(
            events.contains(EventFlags::READABLE) || events.contains(EventFlags::WRITABLE),
            "subscribe requires the readable filter, the writable filter, or both"
        );

        let record = Box::into_raw(Box::new(SubscriptionRecord {
            owner: Arc::clone(handle),
            events_subscribed: events,
            events_this_loop: EventFlags::empty(),
            registered_with_kernel: false,
            on_event: Box::new(on_event),
        }));

        if handle
            .registration
            .compare_exchange(
                ptr::null_mut(),
                record,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // SAFETY: the record was never shared.
            drop(unsafe { Box::from_raw(record) });
            panic!("handle is already subscribed");
        }

        let inner = Arc::clone(&self.inner);
        let record = RecordPtr(record);
        self.schedule_task_now(Task::new(move |status| {
            // SAFETY: tasks run on the event thread, or on the
            // destroying thread after it was joined.
            let thread_data = unsafe { inner.thread_data() };
            run_subscribe(thread_data, record, status);
        }));
    }

    /// Detaches the subscription and schedules its removal.
    ///
    /// The record is freed on the event thread. The callback may fire
    /// once more for events already delivered in the current loop
    /// iteration.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not subscribed.
    pub fn unsubscribe_from_io_events(&self, handle: &IoHandle) {
        let record = handle
            .registration
            .swap(ptr::null_mut(), Ordering::AcqRel);
        assert!(!record.is_null(), "handle is not subscribed");

        let inner = Arc::clone(&self.inner);
        let record = RecordPtr(record);
        self.schedule_task_now(Task::new(move |status| {
            // SAFETY: tasks run on the event thread, or on the
            // destroying thread after it was joined.
            let thread_data = unsafe { inner.thread_data() };
            run_unsubscribe(thread_data, record, status);
        }));
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle").finish_non_exhaustive()
    }
}
