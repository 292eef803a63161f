// src/block_queue.rs
//! Fixed-capacity blocking ring buffer carrying formatted log lines from
//! producer threads to the log flusher.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::sync::{lock, wait};

struct Ring<T> {
    slots: Box<[Option<T>]>,
    front: usize,
    len: usize,
    closed: bool,
}

impl<T> Ring<T> {
    fn take_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.front].take();
        self.front = (self.front + 1) % self.slots.len();
        self.len -= 1;
        item
    }
}

pub struct BlockQueue<T> {
    ring: Mutex<Ring<T>>,
    cond: Condvar,
    capacity: usize,
}

impl<T> BlockQueue<T> {
    /// A zero capacity is bumped to one so `push` can ever succeed.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            ring: Mutex::new(Ring {
                slots: slots.into_boxed_slice(),
                front: 0,
                len: 0,
                closed: false,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Append without blocking. A full or closed queue hands the item back.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut ring = lock(&self.ring);
        if ring.closed || ring.len >= self.capacity {
            self.cond.notify_all();
            return Err(item);
        }
        let back = (ring.front + ring.len) % self.capacity;
        ring.slots[back] = Some(item);
        ring.len += 1;
        self.cond.notify_all();
        Ok(())
    }

    /// Block until an item arrives. Returns `None` once the queue is closed
    /// and drained.
    pub fn pop(&self) -> Option<T> {
        let mut ring = lock(&self.ring);
        loop {
            if let Some(item) = ring.take_front() {
                return Some(item);
            }
            if ring.closed {
                return None;
            }
            ring = wait(&self.cond, ring);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut ring = lock(&self.ring);
        loop {
            if let Some(item) = ring.take_front() {
                return Some(item);
            }
            let now = Instant::now();
            if ring.closed || now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(ring, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            ring = guard;
        }
    }

    /// Refuse further pushes and wake every blocked consumer.
    pub fn close(&self) {
        lock(&self.ring).closed = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        let mut ring = lock(&self.ring);
        while ring.take_front().is_some() {}
        ring.front = 0;
    }

    pub fn is_full(&self) -> bool {
        lock(&self.ring).len >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.ring).len == 0
    }

    pub fn len(&self) -> usize {
        lock(&self.ring).len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> BlockQueue<T> {
    pub fn front(&self) -> Option<T> {
        let ring = lock(&self.ring);
        if ring.len == 0 {
            return None;
        }
        ring.slots[ring.front].clone()
    }

    pub fn back(&self) -> Option<T> {
        let ring = lock(&self.ring);
        if ring.len == 0 {
            return None;
        }
        let back = (ring.front + ring.len - 1) % self.capacity;
        ring.slots[back].clone()
    }
}
