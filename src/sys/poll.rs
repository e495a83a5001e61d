use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::sys::{errno, Change, Event, Filter, Multiplexer, Receipt};

/// Portable readiness selector backed by `poll(2)`.
///
/// Stands in for the kqueue selector on hosts without it. One `pollfd`
/// entry is submitted per `(descriptor, filter)` registration so events
/// keep the per-filter shape the event loop folds from. `poll` has no
/// byte counts, so payloads are synthesized: 1 when the filter is
/// ready, 0 otherwise.
#[derive(Debug)]
pub(crate) struct Selector {
    registrations: Vec<Registration>,
}

#[derive(Debug, Copy, Clone)]
struct Registration {
    fd: RawFd,
    filter: Filter,
    token: usize,
}

impl Selector {
    /// Creates an empty selector.
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Selector {
            registrations: Vec::new(),
        })
    }
}

impl Multiplexer for Selector {
    fn add_with_receipt(&mut self, changes: &[Change]) -> io::Result<Vec<Receipt>> {
        let mut receipts = Vec::with_capacity(changes.len());

        for change in changes {
            // Probe descriptor validity up front so a bad descriptor
            // fails its receipt the way a kernel registration would.
            // SAFETY: fcntl probe, no pointers.
            let error = if unsafe { libc::fcntl(change.fd, libc::F_GETFD) } == -1 {
                io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EBADF)
            } else {
                0
            };

            if error == 0 {
                let existing = self
                    .registrations
                    .iter_mut()
                    .find(|reg| reg.fd == change.fd && reg.filter == change.filter);

                match existing {
                    // Re-adding replaces the registration.
                    Some(reg) => reg.token = change.token,
                    None => self.registrations.push(Registration {
                        fd: change.fd,
                        filter: change.filter,
                        token: change.token,
                    }),
                }
            }

            receipts.push(Receipt {
                fd: change.fd,
                filter: change.filter,
                error,
            });
        }

        Ok(receipts)
    }

    fn delete(&mut self, fd: RawFd, filter: Filter) -> io::Result<()> {
        let before = self.registrations.len();
        self.registrations
            .retain(|reg| !(reg.fd == fd && reg.filter == filter));

        if self.registrations.len() == before {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }

        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<usize> {
        events.clear();

        let mut pollfds: Vec<libc::pollfd> = self
            .registrations
            .iter()
            .map(|reg| libc::pollfd {
                fd: reg.fd,
                events: match reg.filter {
                    Filter::Read => libc::POLLIN,
                    Filter::Write => libc::POLLOUT,
                },
                revents: 0,
            })
            .collect();

        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

        // SAFETY: `pollfds` is a valid array of its own length.
        let count = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if count == -1 {
            return Err(errno!("failed to wait on poll"));
        }

        for (reg, pollfd) in self.registrations.iter().zip(&pollfds) {
            let revents = pollfd.revents;
            if revents == 0 {
                continue;
            }

            let ready = match reg.filter {
                Filter::Read => revents & libc::POLLIN != 0,
                Filter::Write => revents & libc::POLLOUT != 0,
            };
            let eof = revents & libc::POLLHUP != 0;
            let error = revents & (libc::POLLERR | libc::POLLNVAL) != 0;

            if !ready && !eof && !error {
                continue;
            }

            events.push(Event {
                fd: reg.fd,
                filter: reg.filter,
                payload: ready as i64,
                eof,
                error,
                token: reg.token,
            });
        }

        Ok(events.len())
    }
}
