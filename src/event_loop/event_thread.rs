//! The event thread's main loop.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use crate::event_loop::{
    event_flags_from, EventFlags, Inner, LoopState, SubscriptionRecord, ThreadData, ACTIVE_LOOP,
    DEFAULT_TIMEOUT,
};
use crate::sys::Event;

/// Clears the thread-local loop marker when the thread exits, unwind
/// included.
struct ActiveLoopGuard;

impl Drop for ActiveLoopGuard {
    fn drop(&mut self) {
        ACTIVE_LOOP.with(|active| active.set(0));
    }
}

/// Entry point of the event thread.
pub(super) fn run(inner: Arc<Inner>) {
    ACTIVE_LOOP.with(|active| active.set(Arc::as_ptr(&inner) as usize));
    let _guard = ActiveLoopGuard;

    log::trace!("event thread started");

    // SAFETY: this is the event thread; the private region is ours
    // until the loop exits and the thread is joined.
    let thread_data = unsafe { inner.thread_data() };
    debug_assert_eq!(thread_data.state.get(), LoopState::Running);

    let mut events: Vec<Event> = Vec::new();
    // A handle subscribed for both filters can surface as two kernel
    // events in one iteration. They are folded into a single callback
    // with the flags combined, matching the unified readiness
    // interfaces of other platforms.
    let mut ready_records: Vec<*mut SubscriptionRecord> = Vec::new();
    let mut timeout = DEFAULT_TIMEOUT;

    while thread_data.state.get() == LoopState::Running {
        let mut drain_inbox = false;

        let count = match thread_data.selector.borrow_mut().wait(&mut events, timeout) {
            Ok(count) => count,
            Err(err) => {
                // Not fatal: readiness is lost for this iteration but
                // scheduled work still runs. The inbox is drained
                // unconditionally in case the failure swallowed a stop
                // signal; a spurious drain only costs a lock.
                log::warn!("selector wait failed: {err}");
                drain_inbox = true;
                0
            }
        };

        ready_records.clear();
        for event in &events[..count] {
            // A wake through the signal pipe only means "look at the
            // inbox"; the pipe content itself is meaningless.
            if event.fd == inner.signal_pipe.read_fd() {
                drain_inbox = true;
                inner.signal_pipe.drain();
                continue;
            }

            let flags = event_flags_from(event);
            if flags.is_empty() {
                continue;
            }

            let record = event.token as *mut SubscriptionRecord;
            // SAFETY: a live kernel registration implies a live record.
            // Records die only in unsubscribe tasks, and tasks run
            // after this dispatch phase.
            unsafe {
                if (*record).events_this_loop.is_empty() {
                    ready_records.push(record);
                }
                (*record).events_this_loop |= flags;
            }
        }

        for &record in &ready_records {
            // SAFETY: as above. A callback that unsubscribes a handle,
            // its own included, only schedules a task, and tasks cannot
            // run before this phase ends.
            unsafe {
                let record = &mut *record;
                let flags = record.events_this_loop;
                (record.on_event)(&record.owner, flags);
                record.events_this_loop = EventFlags::empty();
            }
        }

        // Callbacks ran first so that work they enqueued is observed in
        // the next iteration's drain, keeping callback order
        // independent of enqueue interleavings.
        if drain_inbox {
            process_inbox(&inner, thread_data);
        }

        // A failed clock read leaves `now` at zero: timed tasks simply
        // wait for a later iteration.
        let now_ns = inner.clock.now_ns().unwrap_or(0);
        thread_data.scheduler.run_all(now_ns);

        timeout = next_timeout(&inner, thread_data);
    }

    log::trace!("event thread stopping");
}

/// Swaps out the pending task list and lifecycle state under the inbox
/// mutex, then feeds the tasks to the scheduler outside it.
fn process_inbox(inner: &Inner, thread_data: &ThreadData) {
    let pending = {
        let mut inbox = inner.inbox.lock().unwrap();

        // Any signal arriving after this clear triggers a fresh wake.
        inbox.thread_signaled = false;

        if inbox.state == LoopState::Stopping && thread_data.state.get() == LoopState::Running {
            // The only place the thread-private state leaves Running.
            thread_data.state.set(LoopState::Stopping);
        }

        mem::take(&mut inbox.pending_tasks)
    };

    for task in pending {
        let run_at_ns = task.scheduled_at_ns;
        if run_at_ns == 0 {
            thread_data.scheduler.schedule_now(task);
        } else {
            thread_data.scheduler.schedule_future(task, run_at_ns);
        }
    }
}

/// Next kernel wait: the time until the scheduler's nearest deadline,
/// bounded by [`DEFAULT_TIMEOUT`]; the default when the clock fails or
/// nothing is queued.
fn next_timeout(inner: &Inner, thread_data: &ThreadData) -> Duration {
    let now_ns = match inner.clock.now_ns() {
        Ok(now_ns) => now_ns,
        Err(_) => return DEFAULT_TIMEOUT,
    };

    let Some(deadline_ns) = thread_data.scheduler.next_deadline() else {
        return DEFAULT_TIMEOUT;
    };

    DEFAULT_TIMEOUT.min(Duration::from_nanos(deadline_ns.saturating_sub(now_ns)))
}
