// src/timer.rs
//! Deadline list for idle-connection eviction.
//!
//! Entries live in an arena and are linked into a doubly linked list kept
//! sorted ascending by expiry. Handles carry a generation so a stale
//! [`TimerId`] (one whose entry was already swept or removed) can never
//! unlink a newer entry that reused the slot.
//!
//! Owned by the event loop thread; nothing here is shared.

use std::time::Instant;

use libc::c_int;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: u32,
    generation: u32,
}

struct Node<T> {
    expire: Instant,
    data: T,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Entry<T> {
    generation: u32,
    node: Option<Node<T>>,
    next_free: Option<usize>,
}

pub struct TimerList<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> Default for TimerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerList<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_head: None,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add an entry, keeping ascending order. Ties go after existing
    /// entries with the same deadline.
    pub fn insert(&mut self, expire: Instant, data: T) -> TimerId {
        let index = self.alloc(Node {
            expire,
            data,
            prev: None,
            next: None,
        });
        match self.head {
            None => {
                self.head = Some(index);
                self.tail = Some(index);
            }
            Some(head) if expire < self.node(head).expire => {
                self.node_mut(index).next = Some(head);
                self.node_mut(head).prev = Some(index);
                self.head = Some(index);
            }
            Some(head) => self.link_after(index, head),
        }
        self.len += 1;
        TimerId {
            index: index as u32,
            generation: self.entries[index].generation,
        }
    }

    /// Move an entry to a new deadline.
    ///
    /// The common case is an extension: the entry can only move towards the
    /// tail, so the scan starts from its old successor. Returns `false` for
    /// a stale id.
    pub fn adjust(&mut self, id: TimerId, expire: Instant) -> bool {
        let Some(index) = self.live_index(id) else {
            return false;
        };
        self.node_mut(index).expire = expire;
        let (prev, next) = {
            let node = self.node(index);
            (node.prev, node.next)
        };

        if let Some(prev) = prev {
            if expire < self.node(prev).expire {
                // Deadline moved earlier than its predecessor.
                self.unlink(index);
                self.relink_from_head(index);
                return true;
            }
        }

        match next {
            Some(next) if expire >= self.node(next).expire => {
                self.unlink(index);
                self.link_after(index, next);
            }
            _ => {}
        }
        true
    }

    /// Unlink and return an entry's payload. `None` for a stale id.
    pub fn remove(&mut self, id: TimerId) -> Option<T> {
        let index = self.live_index(id)?;
        self.unlink(index);
        self.len -= 1;
        Some(self.release(index))
    }

    /// Pop the head if it has expired at `now`.
    ///
    /// Callers loop on this; the first entry still in the future stops the
    /// sweep since nothing behind it can be earlier.
    pub fn pop_expired(&mut self, now: Instant) -> Option<T> {
        let head = self.head?;
        if now < self.node(head).expire {
            return None;
        }
        self.unlink(head);
        self.len -= 1;
        Some(self.release(head))
    }

    pub fn expiry(&self, id: TimerId) -> Option<Instant> {
        self.live_index(id).map(|i| self.node(i).expire)
    }

    pub fn get(&self, id: TimerId) -> Option<&T> {
        self.live_index(id).map(|i| &self.node(i).data)
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.head.map(|h| self.node(h).expire)
    }

    /// Walk entries head to tail.
    pub fn iter(&self) -> impl Iterator<Item = (Instant, &T)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let index = cursor?;
            let node = self.node(index);
            cursor = node.next;
            Some((node.expire, &node.data))
        })
    }

    pub fn clear(&mut self) {
        while let Some(head) = self.head {
            self.unlink(head);
            self.release(head);
        }
        self.len = 0;
    }

    // ---- Internals ----

    fn live_index(&self, id: TimerId) -> Option<usize> {
        let index = id.index as usize;
        let entry = self.entries.get(index)?;
        (entry.generation == id.generation && entry.node.is_some()).then_some(index)
    }

    fn node(&self, index: usize) -> &Node<T> {
        match self.entries[index].node.as_ref() {
            Some(node) => node,
            None => unreachable!("timer index {index} is linked but vacant"),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut Node<T> {
        match self.entries[index].node.as_mut() {
            Some(node) => node,
            None => unreachable!("timer index {index} is linked but vacant"),
        }
    }

    fn alloc(&mut self, node: Node<T>) -> usize {
        match self.free_head {
            Some(index) => {
                let entry = &mut self.entries[index];
                self.free_head = entry.next_free.take();
                entry.node = Some(node);
                index
            }
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    node: Some(node),
                    next_free: None,
                });
                self.entries.len() - 1
            }
        }
    }

    fn release(&mut self, index: usize) -> T {
        let entry = &mut self.entries[index];
        let node = match entry.node.take() {
            Some(node) => node,
            None => unreachable!("double release of timer index {index}"),
        };
        entry.generation = entry.generation.wrapping_add(1);
        entry.next_free = self.free_head;
        self.free_head = Some(index);
        node.data
    }

    /// Insert `index` somewhere after `start`, scanning towards the tail.
    fn link_after(&mut self, index: usize, start: usize) {
        let expire = self.node(index).expire;
        let mut prev = start;
        let mut cursor = self.node(start).next;
        while let Some(current) = cursor {
            if expire < self.node(current).expire {
                self.node_mut(prev).next = Some(index);
                self.node_mut(current).prev = Some(index);
                let node = self.node_mut(index);
                node.prev = Some(prev);
                node.next = Some(current);
                return;
            }
            prev = current;
            cursor = self.node(current).next;
        }
        self.node_mut(prev).next = Some(index);
        let node = self.node_mut(index);
        node.prev = Some(prev);
        node.next = None;
        self.tail = Some(index);
    }

    fn relink_from_head(&mut self, index: usize) {
        match self.head {
            None => {
                self.head = Some(index);
                self.tail = Some(index);
            }
            Some(head) if self.node(index).expire < self.node(head).expire => {
                self.node_mut(index).next = Some(head);
                self.node_mut(head).prev = Some(index);
                self.head = Some(index);
            }
            Some(head) => self.link_after(index, head),
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let node = self.node_mut(index);
            (node.prev.take(), node.next.take())
        };
        match (prev, next) {
            (None, None) => {
                // sole entry
                self.head = None;
                self.tail = None;
            }
            (None, Some(next)) => {
                self.node_mut(next).prev = None;
                self.head = Some(next);
            }
            (Some(prev), None) => {
                self.node_mut(prev).next = None;
                self.tail = Some(prev);
            }
            (Some(prev), Some(next)) => {
                self.node_mut(prev).next = Some(next);
                self.node_mut(next).prev = Some(prev);
            }
        }
    }
}

/// Per-descriptor deadlines for the event loop.
///
/// A descriptor stays tracked from [`ConnTimers::track`] until
/// [`ConnTimers::release`], even after its entry has been popped by a sweep,
/// so `release` succeeds exactly once per admitted connection.
pub struct ConnTimers {
    list: TimerList<c_int>,
    by_fd: Vec<Option<TimerId>>,
}

impl ConnTimers {
    pub fn new(slots: usize) -> Self {
        Self {
            list: TimerList::with_capacity(1024),
            by_fd: vec![None; slots],
        }
    }

    /// Start, or restart, the deadline for `fd`. `false` if `fd` has no slot.
    pub fn track(&mut self, fd: c_int, deadline: Instant) -> bool {
        let Some(slot) = usize::try_from(fd).ok().and_then(|i| self.by_fd.get_mut(i)) else {
            return false;
        };
        let id = self.list.insert(deadline, fd);
        if let Some(old) = slot.replace(id) {
            // stale after a sweep pop, which remove tolerates
            self.list.remove(old);
        }
        true
    }

    /// Push a tracked deadline out. `false` if `fd` is not tracked.
    pub fn extend(&mut self, fd: c_int, deadline: Instant) -> bool {
        match self.id(fd) {
            Some(id) => self.list.adjust(id, deadline),
            None => false,
        }
    }

    pub fn is_tracked(&self, fd: c_int) -> bool {
        self.id(fd).is_some()
    }

    /// Next descriptor past its deadline. It stays tracked until released
    /// or tracked again.
    pub fn pop_expired(&mut self, now: Instant) -> Option<c_int> {
        self.list.pop_expired(now)
    }

    /// Stop tracking `fd`. Only the first call after `track` returns `true`.
    pub fn release(&mut self, fd: c_int) -> bool {
        let Some(id) = usize::try_from(fd)
            .ok()
            .and_then(|i| self.by_fd.get_mut(i))
            .and_then(Option::take)
        else {
            return false;
        };
        self.list.remove(id);
        true
    }

    /// Every tracked descriptor, popped or not.
    pub fn tracked(&self) -> Vec<c_int> {
        self.by_fd
            .iter()
            .enumerate()
            .filter(|(_, id)| id.is_some())
            .filter_map(|(fd, _)| c_int::try_from(fd).ok())
            .collect()
    }

    /// Entries still waiting in the deadline list.
    pub fn pending(&self) -> usize {
        self.list.len()
    }

    fn id(&self, fd: c_int) -> Option<TimerId> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.by_fd.get(i).copied().flatten())
    }
}
