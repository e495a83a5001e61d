use std::sync::mpsc;
use std::time::Instant;

use kevio::{EventLoop, Task};

fn main() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();

    let time = Instant::now();
    let (tx, rx) = mpsc::channel();

    println!("timer tasks...");

    let now_ns = event_loop.now_ns().unwrap();
    for delay_secs in [3_u64, 1, 2] {
        let tx = tx.clone();
        event_loop.schedule_task_future(
            Task::new(move |_| {
                println!("task with {delay_secs}s delay completed");
                tx.send(()).unwrap();
            }),
            now_ns + delay_secs * 1_000_000_000,
        );
    }

    for _ in 0..3 {
        rx.recv().unwrap();
    }

    event_loop.stop();
    event_loop.wait_for_stop_completion().unwrap();

    println!("total time elapsed: {}", time.elapsed().as_secs());
}
