use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{io, mem, ptr};

use crate::sys::{errno, Change, Event, Filter, Multiplexer, Receipt};

/// Max kernel events drained per `wait` call.
const MAX_EVENTS: usize = 100;

/// Readiness selector backed by `kqueue(2)`.
#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
}

impl Selector {
    /// Creates a new kqueue instance.
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, no pointers.
        let fd = unsafe { libc::kqueue() };
        if fd == -1 {
            return Err(errno!("failed to create kqueue"));
        }

        // SAFETY: `kqueue` transferred ownership of the descriptor.
        let kq = unsafe { OwnedFd::from_raw_fd(fd) };

        Ok(Selector { kq })
    }
}

fn raw_filter(filter: Filter) -> i16 {
    match filter {
        Filter::Read => libc::EVFILT_READ as i16,
        Filter::Write => libc::EVFILT_WRITE as i16,
    }
}

fn make_kevent(fd: RawFd, filter: Filter, flags: u16, token: usize) -> libc::kevent {
    // SAFETY: `kevent` is plain old data; zero is a valid bit pattern.
    let mut kev: libc::kevent = unsafe { mem::zeroed() };
    kev.ident = fd as libc::uintptr_t;
    kev.filter = raw_filter(filter) as _;
    kev.flags = flags as _;
    kev.udata = token as _;
    kev
}

impl Multiplexer for Selector {
    fn add_with_receipt(&mut self, changes: &[Change]) -> io::Result<Vec<Receipt>> {
        let mut kevs: Vec<libc::kevent> = changes
            .iter()
            .map(|change| {
                make_kevent(
                    change.fd,
                    change.filter,
                    (libc::EV_ADD | libc::EV_RECEIPT) as u16,
                    change.token,
                )
            })
            .collect();

        // In receipt mode the kernel reports the outcome of each change
        // into the event list, in submission order, instead of
        // delivering readiness events; the change buffer doubles as the
        // output buffer.
        // SAFETY: `kevs` is a valid buffer for both lists and the
        // lengths match.
        let count = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                kevs.as_ptr(),
                kevs.len() as libc::c_int,
                kevs.as_mut_ptr(),
                kevs.len() as libc::c_int,
                ptr::null(),
            )
        };
        if count == -1 {
            return Err(errno!("failed to submit kqueue changes"));
        }

        let mut receipts = Vec::with_capacity(count as usize);
        for (change, kev) in changes.iter().zip(&kevs[..count as usize]) {
            // Receipt results always carry the error flag; the data
            // field holds the actual errno, zero on success.
            debug_assert!(kev.flags & libc::EV_ERROR as u16 != 0);

            receipts.push(Receipt {
                fd: change.fd,
                filter: change.filter,
                error: kev.data as i32,
            });
        }

        Ok(receipts)
    }

    fn delete(&mut self, fd: RawFd, filter: Filter) -> io::Result<()> {
        let kev = make_kevent(fd, filter, libc::EV_DELETE as u16, 0);

        // SAFETY: single-change submission with no event list.
        let res = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                &kev,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if res == -1 {
            return Err(errno!("failed to delete kqueue registration for fd {fd}"));
        }

        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<usize> {
        events.clear();

        let timeout = timespec_from(timeout);
        // SAFETY: `kevent` is plain old data; zero is a valid bit
        // pattern.
        let mut kevs: [libc::kevent; MAX_EVENTS] = unsafe { mem::zeroed() };

        // SAFETY: `kevs` is a valid output buffer of MAX_EVENTS entries.
        let count = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                kevs.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                &timeout,
            )
        };
        if count == -1 {
            return Err(errno!("failed to wait on kqueue"));
        }

        for kev in &kevs[..count as usize] {
            let filter = if kev.filter == libc::EVFILT_READ as _ {
                Filter::Read
            } else if kev.filter == libc::EVFILT_WRITE as _ {
                Filter::Write
            } else {
                continue;
            };

            events.push(Event {
                fd: kev.ident as RawFd,
                filter,
                payload: kev.data as i64,
                eof: kev.flags & libc::EV_EOF as u16 != 0,
                error: kev.flags & libc::EV_ERROR as u16 != 0,
                token: kev.udata as usize,
            });
        }

        Ok(events.len())
    }
}

/// Converts to the kernel timeout representation, saturating the
/// seconds field at the platform maximum with the sub-second part
/// zeroed.
fn timespec_from(timeout: Duration) -> libc::timespec {
    let secs = timeout.as_secs();

    if secs > libc::time_t::MAX as u64 {
        libc::timespec {
            tv_sec: libc::time_t::MAX,
            tv_nsec: 0,
        }
    } else {
        libc::timespec {
            tv_sec: secs as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        }
    }
}
