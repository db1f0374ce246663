//! Batcher (C4): drains a queue into a list, stopping on a time or size
//! cutoff, whichever comes first — and also returns early the moment a
//! poll finds the queue empty. Size is an upper bound, not a minimum: an
//! empty poll always wins over waiting for the threshold to fill.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::queue::Receiver;

/// Poll interval for each queue check while a batch accumulates.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared, mutable `(interval, threshold)` pair. The lifecycle finaliser
/// flips this to effectively-unbounded on shutdown so the coordinator
/// drains whatever remains without further time-slicing.
#[derive(Clone)]
pub struct BatchingParams {
    interval_ms: Arc<AtomicU64>,
    threshold: Arc<AtomicUsize>,
}

impl BatchingParams {
    pub fn new(interval: Duration, threshold: usize) -> Self {
        Self {
            interval_ms: Arc::new(AtomicU64::new(interval.as_millis() as u64)),
            threshold: Arc::new(AtomicUsize::new(threshold)),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }

    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::SeqCst)
    }

    /// Drop the cutoffs so the batcher only stops when a queue empties.
    pub fn set_unbounded(&self) {
        self.interval_ms.store(u64::MAX, Ordering::SeqCst);
        self.threshold.store(usize::MAX, Ordering::SeqCst);
    }
}

/// Drain `rx` into a `Vec`, returning when the `interval` elapses, the
/// batch reaches `threshold` items, or a poll finds the queue empty.
/// Always returns (possibly with an empty list) and never blocks longer
/// than `interval` plus one poll timeout.
pub fn collect_batch<T>(rx: &Receiver<T>, interval: Duration, threshold: usize) -> Vec<T> {
    let mut messages = Vec::new();
    let start = Instant::now();
    loop {
        if start.elapsed() >= interval || messages.len() >= threshold {
            break;
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(item) => messages.push(item),
            Err(_) => break,
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use std::thread;

    #[test]
    fn stops_at_threshold() {
        let (tx, rx) = queue::channel::<i32>(100);
        for i in 0..10 {
            tx.send(i).unwrap();
        }
        let batch = collect_batch(&rx, Duration::from_secs(5), 3);
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn returns_early_on_empty_queue_even_under_threshold() {
        let (_tx, rx) = queue::channel::<i32>(100);
        let start = Instant::now();
        let batch = collect_batch(&rx, Duration::from_secs(5), 100);
        assert!(batch.is_empty());
        // Should return after ~one poll timeout, not the full interval.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn stops_at_interval() {
        let (tx, rx) = queue::channel::<i32>(100);
        let sender = tx.clone();
        thread::spawn(move || {
            for i in 0..50 {
                let _ = sender.send(i);
                thread::sleep(Duration::from_millis(20));
            }
        });
        let batch = collect_batch(&rx, Duration::from_millis(150), 10_000);
        assert!(!batch.is_empty());
        assert!(batch.len() < 50);
    }
}
