//! Bounded blocking FIFO shared by the accept loop and the worker pool.
//!
//! `push` blocks while the queue is full, which throttles the accept loop to
//! worker throughput. `pop` blocks while it is empty.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::error::{HttpdError, Result};

pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// A zero capacity could never accept an item, so it is rejected.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(HttpdError::Queue("capacity must be at least 1".to_string()));
        }

        Ok(Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        })
    }

    /// Enqueue `item`, waiting for a free slot first.
    pub fn push(&self, item: T) {
        let mut items = self.lock();
        while items.len() >= self.capacity {
            items = self
                .not_full
                .wait(items)
                .unwrap_or_else(|e| e.into_inner());
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
    }

    /// Dequeue the oldest item, waiting for one to arrive first.
    pub fn pop(&self) -> T {
        let mut items = self.lock();
        let item = loop {
            match items.pop_front() {
                Some(item) => break item,
                None => {
                    items = self
                        .not_empty
                        .wait(items)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        };
        drop(items);
        self.not_full.notify_one();
        item
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // A panic while holding the lock cannot leave the deque half-updated:
    // every critical section is a single push_back/pop_front.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn rejects_zero_capacity() {
        assert!(WorkQueue::<u32>::new(0).is_err());
    }

    #[test]
    fn delivers_in_fifo_order() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let queue = WorkQueue::new(3)?;
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), 1);
        assert_eq!(queue.pop(), 2);
        assert_eq!(queue.pop(), 3);
        assert!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn push_blocks_while_full() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let queue = Arc::new(WorkQueue::new(1)?);
        queue.push(10);

        let pushed = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = Arc::clone(&queue);
            let pushed = Arc::clone(&pushed);
            thread::spawn(move || {
                queue.push(20);
                pushed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!pushed.load(Ordering::SeqCst), "push went through a full queue");
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop(), 10);
        producer.join().map_err(|_| "producer panicked")?;
        assert!(pushed.load(Ordering::SeqCst));
        assert_eq!(queue.pop(), 20);
        Ok(())
    }

    #[test]
    fn pop_blocks_until_push() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let queue = Arc::new(WorkQueue::new(2)?);
        let (tx, rx) = mpsc::channel();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let item = queue.pop();
                let _ = tx.send(item);
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        queue.push(7u32);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, 7);
        consumer.join().map_err(|_| "consumer panicked")?;
        Ok(())
    }

    #[test]
    fn each_item_reaches_exactly_one_consumer()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        const CONSUMERS: usize = 4;
        const ITEMS: usize = 2_000;

        let queue = Arc::new(WorkQueue::new(CONSUMERS)?);
        let (tx, rx) = mpsc::channel();

        for _ in 0..CONSUMERS {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            thread::spawn(move || {
                loop {
                    let item: usize = queue.pop();
                    if tx.send(item).is_err() {
                        return;
                    }
                }
            });
        }
        drop(tx);

        for item in 0..ITEMS {
            queue.push(item);
            assert!(queue.len() <= queue.capacity());
        }

        let mut seen = HashSet::new();
        for _ in 0..ITEMS {
            let item = rx.recv_timeout(Duration::from_secs(10))?;
            assert!(seen.insert(item), "item {item} delivered twice");
        }
        assert_eq!(seen.len(), ITEMS);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        Ok(())
    }
}
