// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! [`Queue`]: a stand-in for the source's `dispatch_queue_t` ("Per-queue
//! notification delivery is modeled with one dedicated `std::thread` per
//! registered queue plus an `std::sync::mpsc` channel, matching the
//! 'serialized per queue, unordered across queues' guarantee without pulling
//! in an async runtime").
//!
//! A handler registered on a `Queue` always runs after every handler
//! registered on that same `Queue` before it, and never concurrently with
//! another handler on the same `Queue`; handlers on different `Queue`s race
//! freely, exactly like `dispatch_async` on two independent serial queues.

use std::sync::mpsc;
use std::thread;

type Job = Box<dyn FnOnce() + Send>;

/// A serial execution context backed by one dedicated thread. Dropping the
/// last `Arc<Queue>` closes the channel, which ends the thread once any
/// already-queued jobs have run.
pub struct Queue {
    tx: mpsc::Sender<Job>,
}

impl Queue {
    /// Spawns the backing thread and returns a queue ready to accept jobs.
    #[must_use]
    pub fn new(label: &str) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let label = label.to_string();
        thread::Builder::new()
            .name(label)
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .expect("atlas-process: failed to spawn notification queue thread");
        Self { tx }
    }

    /// Enqueues `job`, to run after every job already queued on `self`.
    /// Silently dropped if the backing thread has already exited (it never
    /// does while any `Arc<Queue>` referencing it is alive).
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn jobs_on_one_queue_run_in_submission_order() {
        let queue = Queue::new("test-queue");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            queue.dispatch(move || order.lock().unwrap().push(i));
        }
        // Submit a final job and wait on a channel to know the rest have drained.
        let (done_tx, done_rx) = mpsc::channel();
        queue.dispatch(move || done_tx.send(()).unwrap());
        done_rx.recv().unwrap();
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }
}
