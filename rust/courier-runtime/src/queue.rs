//! Blocking multi-producer/single-consumer priority queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use parking_lot::{Condvar, Mutex};

/// Priority of ordinary traffic.
pub const DEFAULT_PRIORITY: u32 = 0;

/// Priority of timer expirations, so timeouts pre-empt normal messages.
pub const TIMEOUT_PRIORITY: u32 = 1000;

/// Error returned by [`MessageQueue::push`] after the queue was closed. The
/// rejected item is handed back to the caller.
pub struct QueueClosed<T>(pub T);

impl<T> fmt::Debug for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueClosed(..)")
    }
}

impl<T> fmt::Display for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue closed")
    }
}

impl<T> std::error::Error for QueueClosed<T> {}

struct Entry<T> {
    priority: u32,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, lower sequence (older) breaks ties
        // so delivery stays FIFO within one priority.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    closed: bool,
}

/// Blocking MPSC priority queue feeding a component's loop.
///
/// Higher priority first, FIFO within a priority. [`close`](Self::close)
/// wakes the consumer, which observes `None` from [`pop`](Self::pop);
/// items still queued at close time are dropped.
pub struct MessageQueue<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Enqueue an item. Fails only after [`close`](Self::close), returning
    /// the item to the caller.
    pub fn push(&self, item: T, priority: u32) -> Result<(), QueueClosed<T>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueClosed(item));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry {
            priority,
            seq,
            item,
        });
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until an item is available or the queue is closed. `None` is
    /// the closed sentinel.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(entry) = inner.heap.pop() {
                return Some(entry.item);
            }
            self.ready.wait(&mut inner);
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        inner.heap.pop().map(|entry| entry.item)
    }

    /// Close the queue: pending items are dropped, the consumer wakes with
    /// the closed sentinel, and further pushes fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.heap.clear();
        drop(inner);
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_within_one_priority() {
        let queue = MessageQueue::new();
        for i in 0..5 {
            queue.push(i, DEFAULT_PRIORITY).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.pop(), Some(i));
        }
    }

    #[test]
    fn higher_priority_preempts() {
        let queue = MessageQueue::new();
        queue.push("normal-1", DEFAULT_PRIORITY).unwrap();
        queue.push("normal-2", DEFAULT_PRIORITY).unwrap();
        queue.push("timeout", TIMEOUT_PRIORITY).unwrap();
        assert_eq!(queue.pop(), Some("timeout"));
        assert_eq!(queue.pop(), Some("normal-1"));
        assert_eq!(queue.pop(), Some("normal-2"));
    }

    #[test]
    fn mixed_priorities_keep_fifo_per_level() {
        let queue = MessageQueue::new();
        queue.push((1, 'a'), 1).unwrap();
        queue.push((5, 'a'), 5).unwrap();
        queue.push((1, 'b'), 1).unwrap();
        queue.push((5, 'b'), 5).unwrap();
        assert_eq!(queue.pop(), Some((5, 'a')));
        assert_eq!(queue.pop(), Some((5, 'b')));
        assert_eq!(queue.pop(), Some((1, 'a')));
        assert_eq!(queue.pop(), Some((1, 'b')));
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let queue = Arc::new(MessageQueue::<u32>::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn push_after_close_returns_item() {
        let queue = MessageQueue::new();
        queue.close();
        let err = queue.push(7, DEFAULT_PRIORITY).expect_err("queue is closed");
        assert_eq!(err.0, 7);
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn close_drops_queued_items() {
        let queue = MessageQueue::new();
        queue.push(1, DEFAULT_PRIORITY).unwrap();
        queue.push(2, DEFAULT_PRIORITY).unwrap();
        queue.close();
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn producer_wakes_consumer() {
        let queue = Arc::new(MessageQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(99, DEFAULT_PRIORITY).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(99));
    }

    #[test]
    fn many_producers_single_consumer() {
        let queue = Arc::new(MessageQueue::new());
        let mut producers = Vec::new();
        for p in 0..4 {
            let queue = Arc::clone(&queue);
            producers.push(thread::spawn(move || {
                for i in 0..25 {
                    queue.push(p * 100 + i, DEFAULT_PRIORITY).unwrap();
                }
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }
        let mut seen = Vec::new();
        while let Some(v) = queue.try_pop() {
            seen.push(v);
        }
        assert_eq!(seen.len(), 100);
        // per-producer order is preserved
        for p in 0..4 {
            let ours: Vec<i32> = seen.iter().copied().filter(|v| v / 100 == p).collect();
            let mut sorted = ours.clone();
            sorted.sort_unstable();
            assert_eq!(ours, sorted);
        }
    }
}
