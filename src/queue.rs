//! A bounded multi-producer single-consumer queue with an `is_empty`
//! check, used for both the external and internal queues.
//!
//! `std::sync::mpsc` doesn't expose queue length, but the coordinator's
//! and intake workers' termination conditions need to know whether a
//! queue still has pending items. A small shared counter, bumped on send
//! and dropped after a successful receive, gives us that without touching
//! the channel's internals.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

/// A read-only handle on a queue's length, cheaply cloneable, for callers
/// (the coordinator's loop-termination check) that need to know whether a
/// queue is empty without being its consumer.
#[derive(Clone)]
pub struct Watch(Arc<AtomicUsize>);

impl Watch {
    pub fn len(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct Sender<T> {
    inner: SyncSender<T>,
    len: Arc<AtomicUsize>,
}

impl<T> Sender<T> {
    pub fn send(&self, value: T) -> Result<(), mpsc::SendError<T>> {
        self.len.fetch_add(1, Ordering::SeqCst);
        let result = self.inner.send(value);
        if result.is_err() {
            self.len.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    pub fn watch(&self) -> Watch {
        Watch(self.len.clone())
    }
}

pub struct Receiver<T> {
    inner: mpsc::Receiver<T>,
    len: Arc<AtomicUsize>,
}

impl<T> Receiver<T> {
    /// Number of items currently queued (best-effort; this is the
    /// `qsize()` equivalent).
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn watch(&self) -> Watch {
        Watch(self.len.clone())
    }

    /// Poll with a short timeout, the way both the intake workers and the
    /// batcher do (~100ms).
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let result = self.inner.recv_timeout(timeout);
        if result.is_ok() {
            self.len.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }
}

/// Create a bounded counting channel.
pub fn channel<T>(bound: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::sync_channel(bound.max(1));
    let len = Arc::new(AtomicUsize::new(0));
    (
        Sender {
            inner: tx,
            len: len.clone(),
        },
        Receiver { inner: rx, len },
    )
}
