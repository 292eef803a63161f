// src/pool.rs
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::error::{EtudeError, EtudeResult};
use crate::sync::{Semaphore, lock};

/// Bounded FIFO shared by the loop (producer) and the workers (consumers).
///
/// `submit` never blocks; `take` blocks on the semaphore.
pub struct TaskQueue<T> {
    tasks: Mutex<VecDeque<T>>,
    capacity: usize,
    queued: Semaphore,
    closed: AtomicBool,
}

impl<T> TaskQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            queued: Semaphore::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue, or hand the task back if the queue is full or closed.
    pub fn submit(&self, task: T) -> Result<(), T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(task);
        }
        {
            let mut tasks = lock(&self.tasks);
            if tasks.len() >= self.capacity {
                return Err(task);
            }
            tasks.push_back(task);
        }
        self.queued.post();
        Ok(())
    }

    /// Block for the next task. `None` once closed and drained.
    pub fn take(&self) -> Option<T> {
        loop {
            self.queued.wait();
            if let Some(task) = lock(&self.tasks).pop_front() {
                return Some(task);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
        }
    }

    /// Refuse new tasks and wake `consumers` blocked takers.
    pub fn close(&self, consumers: usize) {
        self.closed.store(true, Ordering::Release);
        self.queued.post_many(consumers);
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Fixed set of long-lived workers running `handler` on every task.
pub struct ThreadPool<T: Send + 'static> {
    queue: Arc<TaskQueue<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> ThreadPool<T> {
    pub fn spawn<F>(threads: usize, max_requests: usize, pin: bool, handler: F) -> EtudeResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if threads == 0 {
            return Err(EtudeError::Config("worker thread count must be at least 1".into()));
        }
        if max_requests == 0 {
            return Err(EtudeError::Config("max requests must be at least 1".into()));
        }

        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let handler = Arc::new(handler);
        let mut pool = Self {
            queue: Arc::new(TaskQueue::new(max_requests)),
            handles: Vec::with_capacity(threads),
        };

        for i in 0..threads {
            let core_id = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);
            let queue = pool.queue.clone();
            let handler = handler.clone();

            let handle = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!("worker {} pinned to CPU {}", i, id.id);
                        } else {
                            warn!("worker {} failed to pin to CPU {}", i, id.id);
                        }
                    }
                    while let Some(task) = queue.take() {
                        handler(task);
                    }
                    debug!("worker {} exiting", i);
                })
                .map_err(|source| EtudeError::WorkerSpawn { index: i, source })?;
            pool.handles.push(handle);
        }

        info!("thread pool started: {} workers, queue depth {}", threads, max_requests);
        Ok(pool)
    }

    pub fn submit(&self, task: T) -> Result<(), T> {
        self.queue.submit(task)
    }

    pub fn queue(&self) -> &TaskQueue<T> {
        &self.queue
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Stop accepting work, let workers drain the queue, and join them.
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.queue.close(self.handles.len());
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker panicked");
            }
        }
    }
}

impl<T: Send + 'static> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
