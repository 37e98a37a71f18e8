//! WorkerPool: a fixed-size thread bank with a single fan-in event stream.
//!
//! Workers post payloads through an [`EventSender`]; the pool itself posts a
//! `Finished` marker once each worker's handler returns. The consumer drains
//! the stream until every worker has reported finished, then joins them.

use std::sync::{mpsc, Arc};
use std::thread;

use crate::error::DownloadError;

enum Event<T> {
    Payload(T),
    Finished(Option<DownloadError>),
}

/// What [`WorkerPool::recv`] yields: either a worker-pushed payload, or the
/// terminal marker for one worker (carrying its error, if it failed).
pub enum PoolEvent<T> {
    Payload(T),
    WorkerDone(Option<DownloadError>),
}

/// Handed to each worker so it can push payloads onto the shared stream.
#[derive(Clone)]
pub struct EventSender<T> {
    tx: mpsc::Sender<Event<T>>,
}

impl<T> EventSender<T> {
    pub fn send(&self, payload: T) {
        let _ = self.tx.send(Event::Payload(payload));
    }
}

pub struct WorkerPool<T> {
    rx: mpsc::Receiver<Event<T>>,
    remaining: usize,
    handles: Vec<thread::JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `n` worker threads, each running `handler(worker_id, &sender)`
    /// to completion.
    pub fn spawn<F>(n: usize, handler: F) -> Self
    where
        F: Fn(usize, &EventSender<T>) -> Result<(), DownloadError> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handler = Arc::new(handler);
        let mut handles = Vec::with_capacity(n);
        for worker_id in 0..n {
            let tx = tx.clone();
            let handler = Arc::clone(&handler);
            handles.push(thread::spawn(move || {
                let sender = EventSender { tx: tx.clone() };
                let result = handler(worker_id, &sender);
                let _ = tx.send(Event::Finished(result.err()));
            }));
        }
        drop(tx);
        Self {
            rx,
            remaining: n,
            handles,
        }
    }

    /// Receives the next event. Returns `None` once every worker has posted
    /// its `Finished` marker (the channel is then exhausted).
    pub fn recv(&mut self) -> Option<PoolEvent<T>> {
        if self.remaining == 0 {
            return None;
        }
        match self.rx.recv() {
            Ok(Event::Payload(p)) => Some(PoolEvent::Payload(p)),
            Ok(Event::Finished(e)) => {
                self.remaining -= 1;
                Some(PoolEvent::WorkerDone(e))
            }
            Err(_) => {
                self.remaining = 0;
                None
            }
        }
    }

    /// Joins every worker thread. Call once [`WorkerPool::recv`] has
    /// returned `None`.
    pub fn join(self) {
        for h in self.handles {
            let _ = h.join();
        }
    }
}
