// src/table.rs
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::c_int;

use crate::conn::HttpConn;

/// One connection slot plus the flags the loop and a worker use to hand it
/// back and forth.
pub struct Slot {
    conn: UnsafeCell<Option<Box<HttpConn>>>,
    /// Work for this connection is queued or running on a worker.
    pub processing: AtomicBool,
    /// Worker finished the I/O step it was given.
    pub done: AtomicBool,
    /// Worker asks the loop to evict this connection.
    pub close: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            conn: UnsafeCell::new(None),
            processing: AtomicBool::new(false),
            done: AtomicBool::new(false),
            close: AtomicBool::new(false),
        }
    }

    pub fn clear_flags(&self) {
        self.processing.store(false, Ordering::Release);
        self.done.store(false, Ordering::Release);
        self.close.store(false, Ordering::Release);
    }
}

/// Connections indexed by socket fd, pre-sized for the server's lifetime.
///
/// Buffers are allocated the first time a slot is used and then reused.
///
/// # Safety model
///
/// There is no per-connection lock. A socket is registered one-shot, so
/// after an event is delivered nobody else sees that fd again until the
/// current handler re-arms it. The handler (loop or worker) therefore has
/// exclusive access to the slot's `HttpConn` from event delivery until its
/// re-arm, and must not touch it after re-arming.
pub struct ConnTable {
    slots: Box<[Slot]>,
}

// SAFETY: see the safety model above; the flags are atomics.
unsafe impl Sync for ConnTable {}

impl ConnTable {
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<Slot> = (0..capacity).map(|_| Slot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, fd: c_int) -> Option<&Slot> {
        usize::try_from(fd).ok().and_then(|i| self.slots.get(i))
    }

    /// Exclusive access to the connection living at `fd`, allocating it on
    /// first use.
    ///
    /// # Safety
    ///
    /// The caller must own `fd` in the sense of the type-level safety
    /// model: either it is the loop thread and the socket is not armed or
    /// queued, or it is the worker that dequeued the task for it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn conn_mut(&self, fd: c_int) -> Option<&mut HttpConn> {
        let slot = self.slot(fd)?;
        // SAFETY: exclusivity is guaranteed by the caller.
        let conn = unsafe { &mut *slot.conn.get() };
        Some(conn.get_or_insert_with(|| Box::new(HttpConn::new())))
    }
}
