use std::fmt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::event_loop::{EventFlags, ThreadData};
use crate::sys::{Change, Filter, Receipt};
use crate::task::TaskStatus;

/// Caller-side identity of a descriptor subscribed to an event loop.
///
/// The handle does not own the descriptor; the caller keeps the
/// underlying resource open from subscribe until the unsubscribe task
/// has run (loop teardown counts). One handle carries at most one live
/// subscription at a time.
pub struct IoHandle {
    fd: RawFd,
    /// Live subscription record, null while unsubscribed. Written by
    /// the facade; the record behind it is touched only on the event
    /// thread.
    pub(crate) registration: AtomicPtr<SubscriptionRecord>,
}

impl IoHandle {
    /// Wraps a raw descriptor.
    pub fn new(fd: RawFd) -> Arc<IoHandle> {
        Arc::new(IoHandle {
            fd,
            registration: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// The wrapped descriptor.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl AsRawFd for IoHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoHandle")
            .field("fd", &self.fd)
            .field(
                "subscribed",
                &!self.registration.load(Ordering::Relaxed).is_null(),
            )
            .finish()
    }
}

/// Per-subscription bookkeeping tying a handle to its callback and its
/// kernel registrations.
///
/// Allocated by the facade and owned by the loop from then on. The
/// record's address is the token of every kernel registration for its
/// descriptor, so the record must stay alive while any of those
/// registrations exist; serializing subscribe and unsubscribe on the
/// event thread is what maintains that. Only the unsubscribe task frees
/// the record, whether it ran normally or was cancelled during
/// teardown.
pub(crate) struct SubscriptionRecord {
    pub(crate) owner: Arc<IoHandle>,
    /// Which of readable/writable the caller asked for.
    pub(crate) events_subscribed: EventFlags,
    /// Flags accumulated during the current main-loop iteration; reset
    /// once the callback has fired.
    pub(crate) events_this_loop: EventFlags,
    /// Whether the kernel currently holds registrations for this
    /// record.
    pub(crate) registered_with_kernel: bool,
    pub(crate) on_event: Box<dyn FnMut(&IoHandle, EventFlags) + Send>,
}

/// Raw record pointer that rides inside a task closure.
///
/// The pointee is only ever dereferenced on the event thread, or after
/// that thread has been joined during teardown; either way every access
/// is serialized.
pub(crate) struct RecordPtr(pub(crate) *mut SubscriptionRecord);

// SAFETY: see the type-level contract; the pointer itself is just an
// address.
unsafe impl Send for RecordPtr {}

/// Body of the subscribe task. Runs on the event thread.
pub(crate) fn run_subscribe(thread_data: &ThreadData, record: RecordPtr, status: TaskStatus) {
    let count = thread_data.connected_handle_count.get();
    thread_data.connected_handle_count.set(count + 1);

    if status == TaskStatus::Canceled {
        // Nothing was registered. The record stays alive; the
        // unsubscribe task (or teardown running it cancelled) frees it.
        return;
    }

    // SAFETY: subscribe and unsubscribe tasks are serialized on the
    // event thread, and the record lives until its unsubscribe task.
    let record = unsafe { &mut *record.0 };
    let fd = record.owner.fd();
    let token = record as *mut SubscriptionRecord as usize;

    // The kernel wants one registration per filter. Submitting them as
    // a receipt-mode batch and rolling back below gives the pair a
    // "both or neither" effect: event delivery for a half-installed
    // pair cannot interleave with the rollback, because both happen
    // here, on the event thread.
    let mut changes = Vec::with_capacity(2);
    if record.events_subscribed.contains(EventFlags::READABLE) {
        changes.push(Change {
            fd,
            filter: Filter::Read,
            token,
        });
    }
    if record.events_subscribed.contains(EventFlags::WRITABLE) {
        changes.push(Change {
            fd,
            filter: Filter::Write,
            token,
        });
    }

    // Bound to a local so the selector borrow ends before any callback
    // below can re-enter the loop's API.
    let submitted = thread_data.selector.borrow_mut().add_with_receipt(&changes);

    let receipts = match submitted {
        Ok(receipts) => receipts,
        Err(err) => {
            // The submission itself failed; nothing was applied.
            log::warn!("subscription for fd {fd} failed: {err}");
            record.registered_with_kernel = false;
            (record.on_event)(&record.owner, EventFlags::ERROR);
            return;
        }
    };

    if receipts.iter().all(Receipt::is_ok) {
        record.registered_with_kernel = true;
        return;
    }

    // One filter registered, the other was rejected: delete whatever
    // succeeded, then surface the failure through the callback, since
    // a scheduled task has no return channel.
    {
        let mut selector = thread_data.selector.borrow_mut();
        for receipt in receipts.iter().filter(|receipt| receipt.is_ok()) {
            if let Err(err) = selector.delete(receipt.fd, receipt.filter) {
                log::warn!("rollback for fd {} failed: {err}", receipt.fd);
            }
        }
    }

    if let Some(failed) = receipts.iter().find(|receipt| !receipt.is_ok()) {
        log::warn!(
            "subscription for fd {fd} failed: {}",
            std::io::Error::from_raw_os_error(failed.error)
        );
    }

    record.registered_with_kernel = false;
    (record.on_event)(&record.owner, EventFlags::ERROR);
}

/// Body of the unsubscribe task. Runs on the event thread and always
/// frees the record, even when cancelled.
pub(crate) fn run_unsubscribe(thread_data: &ThreadData, record: RecordPtr, status: TaskStatus) {
    let count = thread_data.connected_handle_count.get();
    thread_data.connected_handle_count.set(count - 1);

    // SAFETY: the facade detached this record from its handle before
    // scheduling us; this task is its sole remaining owner.
    let record = unsafe { Box::from_raw(record.0) };

    if status == TaskStatus::RunReady && record.registered_with_kernel {
        let mut selector = thread_data.selector.borrow_mut();
        let fd = record.owner.fd();

        for (flag, filter) in [
            (EventFlags::READABLE, Filter::Read),
            (EventFlags::WRITABLE, Filter::Write),
        ] {
            if record.events_subscribed.contains(flag) {
                if let Err(err) = selector.delete(fd, filter) {
                    log::warn!("deregistration for fd {fd} failed: {err}");
                }
            }
        }
    }

    // Dropping the box frees the record; on cancellation the kernel
    // registrations never existed or died with the loop.
    drop(record);
}
