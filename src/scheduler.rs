use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::VecDeque;

use crate::task::{Task, TaskStatus};
use crate::util::MinHeap;

/// Entry in the timed-task heap.
///
/// `seq` breaks deadline ties so tasks scheduled for the same instant
/// run in submission order.
#[derive(Debug)]
struct TimedTask {
    run_at_ns: u64,
    seq: u64,
    task: Task,
}

/*
* `Ord` is implemented by hand since `Task` carries no ordering of its
* own; only `(run_at_ns, seq)` matters.
*/

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.run_at_ns, self.seq).cmp(&(other.run_at_ns, other.seq))
    }
}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.run_at_ns == other.run_at_ns && self.seq == other.seq
    }
}

impl Eq for TimedTask {}

/// Thread-private task scheduler: a FIFO of immediate tasks plus a
/// min-heap of timed tasks.
///
/// Every operation takes `&self` so a task callback can schedule
/// follow-up work mid-[`run_all`] without borrowing the scheduler
/// mutably twice. Work submitted while `run_all` executes is held for
/// the next invocation, which bounds each iteration.
///
/// [`run_all`]: Scheduler::run_all
#[derive(Debug)]
pub(crate) struct Scheduler {
    immediate: RefCell<VecDeque<Task>>,
    timed: RefCell<MinHeap<TimedTask>>,
    next_seq: Cell<u64>,
}

impl Scheduler {
    /// Creates an empty `Scheduler`.
    pub(crate) fn new() -> Self {
        Scheduler {
            immediate: RefCell::new(VecDeque::new()),
            timed: RefCell::new(MinHeap::new()),
            next_seq: Cell::new(0),
        }
    }

    /// Queues `task` to run on the next [`run_all`], after previously
    /// queued immediate tasks.
    ///
    /// [`run_all`]: Scheduler::run_all
    pub(crate) fn schedule_now(&self, task: Task) {
        self.immediate.borrow_mut().push_back(task);
    }

    /// Queues `task` to run once [`run_all`] observes a time at or past
    /// `run_at_ns`.
    ///
    /// [`run_all`]: Scheduler::run_all
    pub(crate) fn schedule_future(&self, mut task: Task, run_at_ns: u64) {
        task.scheduled_at_ns = run_at_ns;

        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);

        self.timed.borrow_mut().push(TimedTask {
            run_at_ns,
            seq,
            task,
        });
    }

    /// Earliest time at which queued work becomes runnable: zero when
    /// an immediate task is waiting, the nearest deadline otherwise,
    /// [`None`] when the scheduler is empty.
    pub(crate) fn next_deadline(&self) -> Option<u64> {
        if !self.immediate.borrow().is_empty() {
            return Some(0);
        }

        self.timed.borrow().peek().map(|entry| entry.run_at_ns)
    }

    /// Runs every queued immediate task, then every timed task whose
    /// deadline is at or before `now_ns`, each in a stable order. Tasks
    /// scheduled by a callback during this call run on the next
    /// invocation.
    pub(crate) fn run_all(&self, now_ns: u64) {
        // Both queues are emptied into a local list before any callback
        // runs, so callbacks see the scheduler unborrowed and new work
        // lands in fresh queues.
        let mut due: Vec<Task> = self.immediate.borrow_mut().drain(..).collect();

        {
            let mut timed = self.timed.borrow_mut();
            while timed
                .peek()
                .map_or(false, |entry| entry.run_at_ns <= now_ns)
            {
                if let Some(entry) = timed.pop() {
                    due.push(entry.task);
                }
            }
        }

        for task in due {
            task.invoke(TaskStatus::RunReady);
        }
    }

    /// Invokes every remaining task with the cancellation status, until
    /// no task is left. Part of loop teardown.
    pub(crate) fn cancel_all(&self) {
        loop {
            let mut pending: Vec<Task> = self.immediate.borrow_mut().drain(..).collect();

            while let Some(entry) = self.timed.borrow_mut().pop() {
                pending.push(entry.task);
            }

            if pending.is_empty() {
                break;
            }

            for task in pending {
                task.invoke(TaskStatus::Canceled);
            }
        }
    }
}
