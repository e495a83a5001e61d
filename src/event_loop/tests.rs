use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use std::{io, thread};

use super::*;
use crate::sys::{poll, Change, Filter, Receipt};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn new_loop() -> EventLoop {
    EventLoop::new().expect("failed to create event loop")
}

fn running_loop() -> EventLoop {
    let mut event_loop = new_loop();
    event_loop.run().expect("failed to run event loop");
    event_loop
}

#[test]
fn run_rejects_non_ready_loop() {
    let mut event_loop = running_loop();

    assert!(matches!(event_loop.run(), Err(Error::AlreadyRunning)));

    event_loop.stop();
    event_loop.wait_for_stop_completion().unwrap();

    // Stopped and joined: the loop is ready to run again.
    event_loop.run().unwrap();
    event_loop.stop();
    event_loop.wait_for_stop_completion().unwrap();
}

#[test]
fn stop_is_idempotent() {
    let mut event_loop = new_loop();

    // Not running yet: a no-op.
    event_loop.stop();

    event_loop.run().unwrap();
    event_loop.stop();
    event_loop.stop();
    event_loop.wait_for_stop_completion().unwrap();
}

#[test]
fn scheduled_task_runs_on_event_thread() {
    let event_loop = running_loop();
    let handle = event_loop.handle();

    let (tx, rx) = mpsc::channel();
    let task_handle = event_loop.handle();
    handle.schedule_task_now(Task::new(move |status| {
        tx.send((
            status,
            task_handle.is_on_event_thread(),
            String::from("hello"),
        ))
        .unwrap();
    }));

    let (status, on_thread, message) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(status, TaskStatus::RunReady);
    assert!(on_thread);
    assert_eq!(message, "hello");

    assert!(!handle.is_on_event_thread());
}

#[test]
fn tasks_from_one_thread_run_in_submission_order() {
    let event_loop = running_loop();
    let handle = event_loop.handle();

    let log = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    for id in 0..20 {
        let log = Arc::clone(&log);
        handle.schedule_task_now(Task::new(move |_| log.lock().unwrap().push(id)));
    }
    handle.schedule_task_now(Task::new(move |_| tx.send(()).unwrap()));

    rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
}

#[test]
fn timed_tasks_run_in_deadline_order() {
    let event_loop = running_loop();
    let handle = event_loop.handle();

    let (tx, rx) = mpsc::channel();
    let now_ns = handle.now_ns().unwrap();

    // Submitted out of deadline order on purpose.
    for offset_ms in [50_u64, 10, 30] {
        let tx = tx.clone();
        let task_handle = handle.clone();
        let deadline_ns = now_ns + offset_ms * 1_000_000;
        handle.schedule_task_future(
            Task::new(move |_| {
                tx.send((offset_ms, deadline_ns, task_handle.now_ns().unwrap()))
                    .unwrap();
            }),
            deadline_ns,
        );
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        let (offset_ms, deadline_ns, ran_at_ns) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
        assert!(
            ran_at_ns >= deadline_ns,
            "task for +{offset_ms}ms ran {}ns early",
            deadline_ns - ran_at_ns
        );
        order.push(offset_ms);
    }

    assert_eq!(order, vec![10, 30, 50]);
}

#[test]
fn earlier_deadline_runs_before_later_submission() {
    let event_loop = running_loop();
    let handle = event_loop.handle();

    let (tx, rx) = mpsc::channel();
    let now_ns = handle.now_ns().unwrap();

    // The later deadline is submitted first.
    let late_tx = tx.clone();
    handle.schedule_task_future(
        Task::new(move |_| late_tx.send("late").unwrap()),
        now_ns + 100_000_000,
    );
    handle.schedule_task_future(
        Task::new(move |_| tx.send("early").unwrap()),
        now_ns + 20_000_000,
    );

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), "early");
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), "late");
}

#[test]
fn stop_from_another_thread_halts_promptly() {
    let mut event_loop = running_loop();
    let handle = event_loop.handle();

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.stop();
    });

    // Without the signal pipe the loop would sit in its 100 s kernel
    // wait; a prompt join proves one wake sufficed.
    let start = Instant::now();
    stopper.join().unwrap();
    event_loop.wait_for_stop_completion().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn stop_from_task_callback() {
    let mut event_loop = running_loop();
    let handle = event_loop.handle();

    event_loop.schedule_task_now(Task::new(move |_| handle.stop()));
    event_loop.wait_for_stop_completion().unwrap();
}

#[test]
fn drop_cancels_tasks_scheduled_after_join() {
    let mut event_loop = running_loop();
    event_loop.stop();
    event_loop.wait_for_stop_completion().unwrap();

    let canceled = Arc::new(AtomicUsize::new(0));
    let ran = Arc::new(AtomicUsize::new(0));

    // The thread is joined; these tasks sit in the inbox untouched.
    for _ in 0..100 {
        let canceled = Arc::clone(&canceled);
        let ran = Arc::clone(&ran);
        event_loop.schedule_task_now(Task::new(move |status| match status {
            TaskStatus::Canceled => {
                canceled.fetch_add(1, Ordering::SeqCst);
            }
            TaskStatus::RunReady => {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    drop(event_loop);

    assert_eq!(canceled.load(Ordering::SeqCst), 100);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn drop_cancels_undue_timed_tasks() {
    let mut event_loop = running_loop();
    let handle = event_loop.handle();

    let (tx, rx) = mpsc::channel();
    let (sync_tx, sync_rx) = mpsc::channel();

    let now_ns = handle.now_ns().unwrap();
    handle.schedule_task_future(
        Task::new(move |status| tx.send(status).unwrap()),
        now_ns + 60_000_000_000,
    );
    // Once this marker runs, the timed task above has reached the
    // scheduler's heap.
    handle.schedule_task_now(Task::new(move |_| sync_tx.send(()).unwrap()));
    sync_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    event_loop.stop();
    event_loop.wait_for_stop_completion().unwrap();
    drop(event_loop);

    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).unwrap(),
        TaskStatus::Canceled
    );
}

#[test]
fn simultaneous_read_write_readiness_folds_into_one_callback() {
    let event_loop = running_loop();
    let handle = event_loop.handle();

    let (sock, mut peer) = UnixStream::pair().unwrap();
    // Data is in flight before the registration lands, so both filters
    // become ready in the same loop iteration.
    peer.write_all(b"ping").unwrap();

    let io_handle = IoHandle::new(sock.as_raw_fd());
    let (tx, rx) = mpsc::channel();
    let callbacks = Arc::new(AtomicUsize::new(0));

    let unsubscribe_handle = handle.clone();
    let callback_count = Arc::clone(&callbacks);
    handle.subscribe_to_io_events(
        &io_handle,
        EventFlags::READABLE | EventFlags::WRITABLE,
        move |io_handle, flags| {
            callback_count.fetch_add(1, Ordering::SeqCst);
            unsubscribe_handle.unsubscribe_from_io_events(io_handle);
            tx.send(flags).unwrap();
        },
    );

    let flags = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(flags.contains(EventFlags::READABLE | EventFlags::WRITABLE));

    drop(event_loop);
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);
}

#[test]
fn closed_peer_reports_closed() {
    let event_loop = running_loop();
    let handle = event_loop.handle();

    let (sock, peer) = UnixStream::pair().unwrap();
    drop(peer);

    let io_handle = IoHandle::new(sock.as_raw_fd());
    let (tx, rx) = mpsc::channel();

    let unsubscribe_handle = handle.clone();
    handle.subscribe_to_io_events(&io_handle, EventFlags::READABLE, move |io_handle, flags| {
        if flags.contains(EventFlags::CLOSED) {
            unsubscribe_handle.unsubscribe_from_io_events(io_handle);
            tx.send(flags).unwrap();
        }
    });

    let flags = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(flags.contains(EventFlags::CLOSED));

    drop(event_loop);
}

#[test]
fn subscription_record_freed_exactly_once() {
    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let mut event_loop = running_loop();
    let handle = event_loop.handle();

    let (sock, _peer) = UnixStream::pair().unwrap();
    let io_handle = IoHandle::new(sock.as_raw_fd());

    let drops = Arc::new(AtomicUsize::new(0));
    let counter = DropCounter(Arc::clone(&drops));

    handle.subscribe_to_io_events(&io_handle, EventFlags::READABLE, move |_, _| {
        // The callback owns the counter; it dies with the record.
        let _ = &counter;
    });

    handle.unsubscribe_from_io_events(&io_handle);

    // Tasks run in order: once this marker fires, the unsubscribe task
    // has already freed the record.
    let (tx, rx) = mpsc::channel();
    handle.schedule_task_now(Task::new(move |_| tx.send(()).unwrap()));
    rx.recv_timeout(RECV_TIMEOUT).unwrap();

    assert_eq!(drops.load(Ordering::SeqCst), 1);

    event_loop.stop();
    event_loop.wait_for_stop_completion().unwrap();
    drop(event_loop);

    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

/// Selector that accepts the first filter of a two-filter subscription
/// batch and refuses the second, for exercising the rollback path.
struct RollbackSelector {
    inner: poll::Selector,
    deletions: Arc<Mutex<Vec<(RawFd, Filter)>>>,
}

impl crate::sys::Multiplexer for RollbackSelector {
    fn add_with_receipt(&mut self, changes: &[Change]) -> io::Result<Vec<Receipt>> {
        if changes.len() == 2 {
            let mut receipts = self.inner.add_with_receipt(&changes[..1])?;
            receipts.push(Receipt {
                fd: changes[1].fd,
                filter: changes[1].filter,
                error: libc::EPERM,
            });
            return Ok(receipts);
        }

        self.inner.add_with_receipt(changes)
    }

    fn delete(&mut self, fd: RawFd, filter: Filter) -> io::Result<()> {
        self.deletions.lock().unwrap().push((fd, filter));
        self.inner.delete(fd, filter)
    }

    fn wait(
        &mut self,
        events: &mut Vec<crate::sys::Event>,
        timeout: Duration,
    ) -> io::Result<usize> {
        self.inner.wait(events, timeout)
    }
}

#[test]
fn failed_second_registration_rolls_back_and_reports_error() {
    let deletions = Arc::new(Mutex::new(Vec::new()));
    let selector = RollbackSelector {
        inner: poll::Selector::new().unwrap(),
        deletions: Arc::clone(&deletions),
    };

    let mut event_loop =
        EventLoop::with_parts(Box::new(selector), Box::new(MonotonicClock::new())).unwrap();
    event_loop.run().unwrap();
    let handle = event_loop.handle();

    let (sock, mut peer) = UnixStream::pair().unwrap();
    let fd = sock.as_raw_fd();
    let io_handle = IoHandle::new(fd);

    let (tx, rx) = mpsc::channel();
    let callbacks = Arc::new(AtomicUsize::new(0));
    let callback_count = Arc::clone(&callbacks);

    handle.subscribe_to_io_events(
        &io_handle,
        EventFlags::READABLE | EventFlags::WRITABLE,
        move |_, flags| {
            callback_count.fetch_add(1, Ordering::SeqCst);
            tx.send(flags).unwrap();
        },
    );

    // Exactly one callback, carrying the error flag.
    let flags = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(flags, EventFlags::ERROR);

    // The filter that did register was rolled back.
    assert_eq!(
        deletions.lock().unwrap().as_slice(),
        &[(fd, Filter::Read)]
    );

    // Readiness on the descriptor no longer reaches the subscriber.
    peer.write_all(b"ping").unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);

    // A failed subscription still owns its record until unsubscribed.
    handle.unsubscribe_from_io_events(&io_handle);

    event_loop.stop();
    event_loop.wait_for_stop_completion().unwrap();
    drop(event_loop);
}

#[test]
fn drop_without_running_cancels_pending_work() {
    let event_loop = new_loop();

    let canceled = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let canceled = Arc::clone(&canceled);
        event_loop.schedule_task_now(Task::new(move |status| {
            assert_eq!(status, TaskStatus::Canceled);
            canceled.fetch_add(1, Ordering::SeqCst);
        }));
    }

    drop(event_loop);
    assert_eq!(canceled.load(Ordering::SeqCst), 10);
}

#[test]
fn canceled_task_may_schedule_followup_work() {
    let mut event_loop = running_loop();
    let handle = event_loop.handle();

    event_loop.stop();
    event_loop.wait_for_stop_completion().unwrap();

    let followup_canceled = Arc::new(AtomicUsize::new(0));

    let followup = Arc::clone(&followup_canceled);
    let chain_handle = handle.clone();
    let now_ns = handle.now_ns().unwrap();
    event_loop.schedule_task_future(
        Task::new(move |status| {
            assert_eq!(status, TaskStatus::Canceled);
            let followup = Arc::clone(&followup);
            // Cancellation handlers may hand the loop more work; it is
            // drained (and cancelled) before teardown finishes.
            chain_handle.schedule_task_now(Task::new(move |status| {
                assert_eq!(status, TaskStatus::Canceled);
                followup.fetch_add(1, Ordering::SeqCst);
            }));
        }),
        now_ns + 60_000_000_000,
    );

    drop(event_loop);
    assert_eq!(followup_canceled.load(Ordering::SeqCst), 1);
}
