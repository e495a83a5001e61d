use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::sys::errno;

/// Self-signal pipe.
///
/// The read end is registered with the loop's selector so that a byte
/// written from any thread wakes the event thread. Multiple writes
/// coalesce into at least one wake; the event thread drains everything
/// that was written before going back to sleep.
#[derive(Debug)]
pub(crate) struct SignalPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl SignalPipe {
    /// Opens the pipe with both ends non-blocking and close-on-exec.
    pub(crate) fn open() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];

        // SAFETY: `fds` is a valid out-pointer for two descriptors.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(errno!("failed to open signal pipe"));
        }

        // SAFETY: `pipe` transferred ownership of both descriptors.
        let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        // SAFETY: as above.
        let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        set_nonblocking_cloexec(read.as_raw_fd())?;
        set_nonblocking_cloexec(write.as_raw_fd())?;

        Ok(SignalPipe { read, write })
    }

    /// The descriptor to register with the selector.
    #[inline]
    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Writes one byte to wake the event thread.
    ///
    /// Best-effort: a full pipe means a previous write already
    /// guarantees a wake, so `EAGAIN` is ignored. Any other failure
    /// means the loop has lost its wake channel.
    pub(crate) fn signal(&self) {
        let byte = [1_u8];

        loop {
            // SAFETY: the write end stays open for the life of the pipe.
            let res = unsafe {
                libc::write(
                    self.write.as_raw_fd(),
                    byte.as_ptr() as *const libc::c_void,
                    1,
                )
            };
            if res != -1 {
                return;
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return,
                _ => {
                    debug_assert!(false, "signal pipe write failed: {err}");
                    log::warn!("signal pipe write failed: {err}");
                    return;
                }
            }
        }
    }

    /// Drains whatever bytes have accumulated. Runs on the event thread
    /// once the read end reports readable.
    pub(crate) fn drain(&self) {
        let mut buf = [0_u8; 32];

        loop {
            // SAFETY: reading into a local buffer from an open
            // descriptor.
            let res = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };

            if res > 0 {
                continue;
            }

            if res == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }

            // Empty (EAGAIN) or closed; either way there is nothing
            // left to read.
            return;
        }
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(errno!("failed to set O_NONBLOCK on signal pipe"));
        }

        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags == -1 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) == -1 {
            return Err(errno!("failed to set FD_CLOEXEC on signal pipe"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_one(pipe: &SignalPipe) -> isize {
        let mut buf = [0_u8; 1];
        // SAFETY: reading into a local buffer.
        unsafe {
            libc::read(
                pipe.read.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                1,
            )
        }
    }

    #[test]
    fn read_end_is_nonblocking() {
        let pipe = SignalPipe::open().unwrap();

        assert_eq!(read_one(&pipe), -1);
        assert_eq!(
            io::Error::last_os_error().raw_os_error(),
            Some(libc::EAGAIN)
        );
    }

    #[test]
    fn signal_makes_read_end_readable() {
        let pipe = SignalPipe::open().unwrap();

        pipe.signal();
        assert_eq!(read_one(&pipe), 1);
    }

    #[test]
    fn drain_empties_coalesced_signals() {
        let pipe = SignalPipe::open().unwrap();

        for _ in 0..5 {
            pipe.signal();
        }
        pipe.drain();

        assert_eq!(read_one(&pipe), -1);
        assert_eq!(
            io::Error::last_os_error().raw_os_error(),
            Some(libc::EAGAIN)
        );
    }
}
