//! Bounded in-memory queues between the HTTP handlers (producers) and the
//! recorder drain loops (single consumer each).

use std::collections::VecDeque;
use std::sync::Mutex;

use flagrelay_lib::{Event, Impression, Metadata};

/// An impression waiting to be recorded, tagged with its origin.
#[derive(Debug, Clone)]
pub struct StoredImpression {
    pub metadata: Metadata,
    pub feature: String,
    pub impression: Impression,
}

/// An event waiting to be recorded, tagged with its origin.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub metadata: Metadata,
    pub event: Event,
}

/// Mutex-guarded FIFO with a hard capacity. Pushes beyond capacity are
/// rejected so a stalled upstream cannot grow memory without bound.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue one item; `Err` gives the item back when the queue is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock().expect("queue lock poisoned");
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        Ok(())
    }

    /// Dequeue up to `n` items in arrival order.
    pub fn pop_n(&self, n: usize) -> Vec<T> {
        let mut items = self.items.lock().expect("queue lock poisoned");
        let take = n.min(items.len());
        items.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_pop_preserve_order() {
        let queue = BoundedQueue::new(10);
        for n in 0..5 {
            queue.push(n).unwrap();
        }
        assert_eq!(queue.pop_n(3), vec![0, 1, 2]);
        assert_eq!(queue.pop_n(10), vec![3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_rejects_pushes() {
        let queue = BoundedQueue::new(2);
        queue.push("a").unwrap();
        queue.push("b").unwrap();
        assert_eq!(queue.push("c"), Err("c"));
        assert_eq!(queue.len(), 2);
    }
}
