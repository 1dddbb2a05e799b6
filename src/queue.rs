//! Multi-producer queue drained once per tick by the application thread.
//!
//! Background threads (the RPC reader, coordinator connection handlers) only
//! ever push. The single application thread drains. An atomic pending flag
//! lets the tick skip lock acquisition entirely on the common empty path, so
//! a stalled producer can never make the render loop wait.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct PendingQueue<T> {
    pending: AtomicBool,
    items: Mutex<Vec<T>>,
}

impl<T> PendingQueue<T> {
    pub fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            items: Mutex::new(Vec::new()),
        }
    }

    /// Append one item. Callable from any thread.
    pub fn push(&self, item: T) {
        let mut items = self.items.lock();
        items.push(item);
        self.pending.store(true, Ordering::Release);
    }

    /// Take everything queued so far, in arrival order.
    ///
    /// Returns an empty vec without touching the lock when nothing is
    /// pending. Must only be called from the single consumer thread.
    pub fn drain(&self) -> Vec<T> {
        if !self.pending.load(Ordering::Acquire) {
            return Vec::new();
        }
        let mut items = self.items.lock();
        // Cleared under the lock so a concurrent push cannot get lost
        // between the swap and the flag write.
        self.pending.store(false, Ordering::Release);
        std::mem::take(&mut *items)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn drain_returns_items_in_push_order() {
        let queue = PendingQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.drain(), vec![1, 2, 3]);
    }

    #[test]
    fn empty_drain_is_empty_and_side_effect_free() {
        let queue: PendingQueue<u32> = PendingQueue::new();
        assert!(queue.drain().is_empty());
        assert!(!queue.is_pending());
        queue.push(7);
        assert_eq!(queue.drain(), vec![7]);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn preserves_per_producer_fifo_under_contention() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 500;

        let queue = Arc::new(PendingQueue::new());
        let mut handles = Vec::new();
        for producer in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    queue.push((producer, seq));
                }
            }));
        }

        let mut drained = Vec::new();
        while drained.len() < (PRODUCERS * PER_PRODUCER) as usize {
            drained.extend(queue.drain());
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Each producer's own sequence must come out strictly increasing.
        let mut last_seen = vec![None; PRODUCERS as usize];
        for (producer, seq) in drained {
            if let Some(prev) = last_seen[producer as usize] {
                assert!(seq > prev, "producer {producer} reordered: {seq} after {prev}");
            }
            last_seen[producer as usize] = Some(seq);
        }
        for (producer, last) in last_seen.iter().enumerate() {
            assert_eq!(*last, Some(PER_PRODUCER - 1), "producer {producer} lost items");
        }
    }
}
