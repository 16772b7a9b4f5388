//! Bounded MPSC input queues for the replica event loop.
//!
//! Channels cannot express the dispose-with-drain teardown contract (every
//! queued request must be answered at shutdown), so this is a small mutexed
//! ring. Enqueues are non-blocking; the consumer drains in batches.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Why an enqueue was rejected. The rejected item is handed back so callers
/// can answer their clients.
#[derive(Debug)]
pub enum PutError<T> {
    Full(T),
    Disposed(T),
}

struct QueueInner<T> {
    items: VecDeque<T>,
    disposed: bool,
}

/// Bounded multi-producer single-consumer queue.
pub struct EventQueue<T> {
    name: &'static str,
    capacity: usize,
    inner: Mutex<QueueInner<T>>,
}

impl<T> EventQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                disposed: false,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Non-blocking enqueue. Overflow and enqueue-after-dispose return the
    /// item to the caller.
    pub fn put(&self, item: T) -> Result<(), PutError<T>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.disposed {
            return Err(PutError::Disposed(item));
        }
        if inner.items.len() >= self.capacity {
            return Err(PutError::Full(item));
        }
        inner.items.push_back(item);
        Ok(())
    }

    /// Move up to `max` items into `out`, returning how many were taken.
    pub fn get(&self, max: usize, out: &mut Vec<T>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let n = max.min(inner.items.len());
        out.extend(inner.items.drain(..n));
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue and hand back everything still buffered so the caller
    /// can answer each pending item.
    pub fn dispose(&self) -> Vec<T> {
        let mut inner = self.inner.lock().unwrap();
        inner.disposed = true;
        inner.items.drain(..).collect()
    }
}
