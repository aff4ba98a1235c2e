//! Bounded FIFO between session producers and the datagram sender.

use super::ReportError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Fixed-capacity record queue. Full queues evict the oldest entry instead of
/// blocking or rejecting the producer.
#[derive(Debug, Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

#[derive(Debug)]
struct QueueInner {
    capacity: usize,
    entries: Mutex<VecDeque<Bytes>>,
    ready: Notify,
    evicted: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Result<Self, ReportError> {
        if capacity == 0 {
            return Err(ReportError::Initialization(
                "event queue capacity must be > 0".into(),
            ));
        }
        Ok(Self {
            inner: Arc::new(QueueInner {
                capacity,
                entries: Mutex::new(VecDeque::with_capacity(capacity)),
                ready: Notify::new(),
                evicted: AtomicU64::new(0),
            }),
        })
    }

    /// Insert without blocking; evicts exactly one oldest entry when full.
    pub fn enqueue(&self, record: Bytes) {
        {
            let mut entries = self.inner.entries.lock();
            if entries.len() >= self.inner.capacity {
                let _ = entries.pop_front();
                let total = self.inner.evicted.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(evicted_total = total, "event queue full; dropped oldest record");
            }
            entries.push_back(record);
        }
        self.inner.ready.notify_one();
    }

    /// Suspend until a record is available and return it in FIFO order.
    pub async fn dequeue(&self) -> Bytes {
        loop {
            if let Some(record) = self.try_dequeue() {
                return record;
            }
            self.inner.ready.notified().await;
        }
    }

    pub fn try_dequeue(&self) -> Option<Bytes> {
        self.inner.entries.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Total records dropped by overflow eviction.
    pub fn evicted(&self) -> u64 {
        self.inner.evicted.load(Ordering::Relaxed)
    }

    /// Copy of the pending records, oldest first.
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.inner.entries.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(n: usize) -> Bytes {
        Bytes::from(format!("r{n}"))
    }

    #[test]
    fn zero_capacity_is_an_initialization_failure() {
        assert!(matches!(
            EventQueue::new(0),
            Err(ReportError::Initialization(_))
        ));
    }

    #[test]
    fn overflow_keeps_newest_in_order() {
        let queue = EventQueue::new(24).unwrap();
        for n in 1..=30 {
            queue.enqueue(record(n));
        }
        let expected: Vec<Bytes> = (7..=30).map(record).collect();
        assert_eq!(queue.snapshot(), expected);
        assert_eq!(queue.evicted(), 6);
    }

    #[test]
    fn one_past_capacity_drops_only_the_oldest() {
        for capacity in 1..=5 {
            let queue = EventQueue::new(capacity).unwrap();
            for n in 0..=capacity {
                queue.enqueue(record(n));
            }
            let expected: Vec<Bytes> = (1..=capacity).map(record).collect();
            assert_eq!(queue.snapshot(), expected);
        }
    }

    #[test]
    fn terminal_record_survives_backlog() {
        let queue = EventQueue::new(4).unwrap();
        for n in 0..10 {
            queue.enqueue(record(n));
        }
        queue.enqueue(Bytes::from_static(b"stop"));
        assert_eq!(queue.snapshot().last().unwrap(), &Bytes::from_static(b"stop"));
    }

    #[tokio::test]
    async fn dequeue_waits_for_producer() {
        let queue = EventQueue::new(2).unwrap();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());
        queue.enqueue(record(1));
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, record(1));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn dequeue_preserves_fifo() {
        let queue = EventQueue::new(8).unwrap();
        for n in 0..3 {
            queue.enqueue(record(n));
        }
        for n in 0..3 {
            assert_eq!(queue.dequeue().await, record(n));
        }
    }
}
