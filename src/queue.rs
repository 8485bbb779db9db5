//! Bounded concurrent FIFO queue (spec §4.1).
//!
//! Grounded on `original_source/src/common/concurrency_queue.hh`: a
//! `std::queue` behind a mutex + condition variable, with `push`/`pop`/
//! `front`/`back`/`size`. `pop`, `front`, and `back` block until the queue
//! is non-empty; `push` blocks until there is room when a capacity is set.
//! Multiple producers and consumers are supported; no fairness guarantee is
//! made across waiting consumers (the condvar wakes whichever thread the OS
//! schedules next, matching the reference's `notify_one`).

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
}

/// A FIFO queue with optional bounded capacity. `capacity = None` means
/// unbounded, matching the reference implementation; a capacity is useful
/// for the bounded queues spec §4.2 calls for between pipeline stages.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: Option<usize>) -> Self {
        BoundedQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Pushes a value, blocking if the queue is at capacity.
    pub fn push(&self, value: T) {
        let mut guard = self.inner.lock();
        if let Some(cap) = self.capacity {
            while guard.items.len() >= cap {
                self.not_full.wait(&mut guard);
            }
        }
        guard.items.push_back(value);
        drop(guard);
        self.not_empty.notify_one();
    }

    /// Removes and returns the front item, blocking until one is available.
    pub fn pop(&self) -> T {
        let mut guard = self.inner.lock();
        while guard.items.is_empty() {
            self.not_empty.wait(&mut guard);
        }
        let value = guard.items.pop_front().expect("checked non-empty above");
        drop(guard);
        self.not_full.notify_one();
        value
    }

    /// Removes and returns the front item if one is already available,
    /// without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let mut guard = self.inner.lock();
        let value = guard.items.pop_front();
        drop(guard);
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }

    pub fn size(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Blocks until non-empty, then returns a clone of the front item
    /// without removing it.
    pub fn front(&self) -> T {
        let mut guard = self.inner.lock();
        while guard.items.is_empty() {
            self.not_empty.wait(&mut guard);
        }
        guard.items.front().expect("checked non-empty above").clone()
    }

    /// Blocks until non-empty, then returns a clone of the back item
    /// without removing it.
    pub fn back(&self) -> T {
        let mut guard = self.inner.lock();
        while guard.items.is_empty() {
            self.not_empty.wait(&mut guard);
        }
        guard.items.back().expect("checked non-empty above").clone()
    }

    pub fn try_front(&self) -> Option<T> {
        self.inner.lock().items.front().cloned()
    }

    pub fn try_back(&self) -> Option<T> {
        self.inner.lock().items.back().cloned()
    }

    /// Drains up to `n` items from the front, without blocking for more
    /// than are already present.
    pub fn drain_up_to(&self, n: usize) -> Vec<T> {
        let mut guard = self.inner.lock();
        let take = n.min(guard.items.len());
        let drained: Vec<T> = guard.items.drain(..take).collect();
        drop(guard);
        if !drained.is_empty() {
            self.not_full.notify_all();
        }
        drained
    }
}
