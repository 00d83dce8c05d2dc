//! Bounded drop-oldest work queue
//!
//! `push` never blocks: when the queue is full the oldest entry is evicted to
//! make room. A single consumer waits with `recv`.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Append `item`, returning the evicted oldest entry if the queue was full
    pub fn push(&self, item: T) -> Option<T> {
        let dropped = {
            let mut items = self.items.lock();
            let dropped = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            dropped
        };
        if dropped.is_some() {
            debug!("Queue full ({}), dropped oldest entry", self.capacity);
        }
        self.notify.notify_one();
        dropped
    }

    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Wait for the next item; `None` once `cancel` fires
    pub async fn recv(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            tokio::select! {
                _ = self.notify.notified() => {},
                _ = cancel.cancelled() => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Copy of the queued items, oldest first
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_overflow_drops_oldest() {
        let queue = BoundedQueue::new(50);
        for n in 1..=50 {
            assert_eq!(queue.push(n), None);
        }
        assert_eq!(queue.push(51), Some(1));

        assert_eq!(queue.snapshot(), (2..=51).collect::<Vec<_>>());
        assert!(logs_contain("dropped oldest entry"));
    }

    #[tokio::test]
    async fn test_recv_waits_for_push() {
        let queue = Arc::new(BoundedQueue::new(4));
        let cancel = CancellationToken::new();

        let consumer = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.recv(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push("task");

        assert_eq!(consumer.await.unwrap(), Some("task"));
    }

    #[tokio::test]
    async fn test_recv_returns_none_on_cancel() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(queue.recv(&cancel).await, None);
    }
}
