// src/sync.rs
//! Thin synchronization helpers shared by the task queue, the log queue and
//! the database pool.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Every structure guarded here stays consistent across a panic (plain
/// queues and maps), so poisoning carries no information worth aborting on.
#[inline]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Block on a condition variable with poison recovery.
#[inline]
pub fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// Counting semaphore built from a mutex-guarded counter and a condvar.
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Take one permit, blocking until one is available.
    pub fn wait(&self) {
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            permits = wait(&self.cond, permits);
        }
        *permits -= 1;
    }

    /// Take one permit if available without blocking.
    pub fn try_wait(&self) -> bool {
        let mut permits = lock(&self.permits);
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Take one permit, giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(permits, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            permits = guard;
        }
        *permits -= 1;
        true
    }

    /// Release one permit and wake one waiter.
    pub fn post(&self) {
        let mut permits = lock(&self.permits);
        *permits += 1;
        self.cond.notify_one();
    }

    /// Release `n` permits at once.
    pub fn post_many(&self, n: usize) {
        let mut permits = lock(&self.permits);
        *permits += n;
        self.cond.notify_all();
    }

    pub fn available(&self) -> usize {
        *lock(&self.permits)
    }
}
