use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;

use kevio::{EventFlags, EventLoop, IoHandle};

fn main() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();

    let (sock, mut peer) = UnixStream::pair().unwrap();
    peer.write_all(b"hello from the peer").unwrap();

    let io_handle = IoHandle::new(sock.as_raw_fd());
    let (tx, rx) = mpsc::channel();

    let handle = event_loop.handle();
    event_loop.subscribe_to_io_events(
        &io_handle,
        EventFlags::READABLE | EventFlags::WRITABLE,
        move |io_handle, flags| {
            println!("fd {} is ready: {flags:?}", io_handle.fd());
            handle.unsubscribe_from_io_events(io_handle);
            tx.send(()).unwrap();
        },
    );

    rx.recv().unwrap();

    event_loop.stop();
    event_loop.wait_for_stop_completion().unwrap();
}
