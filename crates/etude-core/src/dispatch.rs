// src/dispatch.rs
//! The two ways of splitting connection work between the event loop and
//! the worker pool.
//!
//! [`LoopDrivesIo`] has the loop do every `read`/`writev` and sends only
//! parsing to workers. [`WorkerDrivesIo`] sends the raw readiness event to a
//! worker, which performs the syscall itself, while the loop spins until the
//! worker reports back so it can evict right away on failure.
//!
//! Either way, whoever holds a connection re-arms its socket before
//! releasing it, and the release is the last step that touches it. The loop
//! waits out that release before acting on the next event for the socket.

use std::hint;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use libc::c_int;
use tracing::{debug, warn};

use crate::config::DispatchMode;
use crate::conn::{Flush, HttpConn, Next};
use crate::db::ConnectionPool;
use crate::metrics::ServerMetrics;
use crate::pool::ThreadPool;
use crate::router::Router;
use crate::syscalls::{Epoll, Ready, conn_interest};
use crate::table::{ConnTable, Slot};

/// State shared by the loop and every worker.
pub struct Shared {
    pub table: ConnTable,
    pub epoll: Epoll,
    pub router: Router,
    pub db: ConnectionPool,
    pub metrics: Arc<ServerMetrics>,
    pub conn_edge: bool,
}

impl Shared {
    /// Re-arm a one-shot registration. Failure means the socket is already
    /// gone; the loop cleans it up through hangup or sweep.
    pub fn arm(&self, fd: c_int, ready: Ready) {
        if let Err(e) = self.epoll.modify(fd, conn_interest(ready, self.conn_edge)) {
            debug!("re-arm fd {} failed: {}", fd, e);
        }
    }

    /// Worker-side parse and respond on already-buffered bytes.
    fn process(&self, conn: &mut HttpConn) -> Next {
        let mut db = self.db.acquire();
        let next = conn.process(&self.router, &mut *db);
        if next == Next::Write {
            self.metrics.inc_req();
        }
        next
    }

    /// Wait until no worker holds `fd`.
    ///
    /// Any event for a one-shot socket means its holder has already
    /// re-armed it, so at most the final release store is outstanding.
    pub fn settle(&self, fd: c_int) {
        if let Some(slot) = self.table.slot(fd) {
            spin_until(|| !slot.processing.load(Ordering::Acquire));
        }
    }

    fn flush(&self, conn: &mut HttpConn) -> Flush {
        let before = conn.pending_bytes();
        let flush = conn.write();
        self.metrics
            .add_bytes(before.saturating_sub(conn.pending_bytes()));
        flush
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Read the socket, then parse.
    Read,
    /// Flush the staged response.
    Write,
    /// Parse bytes the loop already read.
    Process,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub fd: c_int,
    pub kind: TaskKind,
}

/// What the loop does with the connection's timer afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Activity seen; push the deadline out.
    Extend,
    /// Close the connection now.
    Evict,
    /// Activity seen, but the task queue was full. The loop keeps the task
    /// and resubmits it later.
    Retry(Task),
}

pub trait Dispatcher: Send + Sync {
    fn mode(&self) -> DispatchMode;

    /// Loop side: the socket is readable.
    fn on_readable(&self, shared: &Shared, pool: &ThreadPool<Task>, fd: c_int) -> Action;

    /// Loop side: the socket is writable.
    fn on_writable(&self, shared: &Shared, pool: &ThreadPool<Task>, fd: c_int) -> Action;

    /// Loop side: hand a task to the pool.
    fn submit(&self, shared: &Shared, pool: &ThreadPool<Task>, task: Task) -> Action;

    /// Worker side.
    fn run(&self, shared: &Shared, task: Task);
}

/// Pick the implementation once at startup.
pub fn select(mode: DispatchMode) -> Arc<dyn Dispatcher> {
    match mode {
        DispatchMode::LoopDrivesIo => Arc::new(LoopDrivesIo),
        DispatchMode::WorkerDrivesIo => Arc::new(WorkerDrivesIo),
    }
}

fn spin_until(done: impl Fn() -> bool) {
    let mut spins = 0u32;
    while !done() {
        if spins < 128 {
            hint::spin_loop();
            spins += 1;
        } else {
            thread::yield_now();
        }
    }
}

fn slot(shared: &Shared, fd: c_int) -> Option<&Slot> {
    let slot = shared.table.slot(fd);
    if slot.is_none() {
        warn!("event for fd {} outside the connection table", fd);
    }
    slot
}

// ---- Loop drives I/O ----

pub struct LoopDrivesIo;

impl Dispatcher for LoopDrivesIo {
    fn mode(&self) -> DispatchMode {
        DispatchMode::LoopDrivesIo
    }

    fn on_readable(&self, shared: &Shared, pool: &ThreadPool<Task>, fd: c_int) -> Action {
        let Some(slot) = slot(shared, fd) else {
            return Action::Evict;
        };
        // SAFETY: the event disarmed the socket and no task is in flight.
        let Some(conn) = (unsafe { shared.table.conn_mut(fd) }) else {
            return Action::Evict;
        };
        if !conn.read_once() {
            return Action::Evict;
        }
        slot.processing.store(true, Ordering::Release);
        self.submit(
            shared,
            pool,
            Task {
                fd,
                kind: TaskKind::Process,
            },
        )
    }

    fn on_writable(&self, shared: &Shared, _pool: &ThreadPool<Task>, fd: c_int) -> Action {
        let Some(slot) = slot(shared, fd) else {
            return Action::Evict;
        };
        if slot.close.load(Ordering::Acquire) {
            return Action::Evict;
        }
        // SAFETY: as in `on_readable`.
        let Some(conn) = (unsafe { shared.table.conn_mut(fd) }) else {
            return Action::Evict;
        };
        match shared.flush(conn) {
            Flush::Pending => {
                shared.arm(fd, Ready::Write);
                Action::Extend
            }
            Flush::Done { keep_alive: true } => {
                shared.arm(fd, Ready::Read);
                Action::Extend
            }
            Flush::Done { keep_alive: false } | Flush::Failed => Action::Evict,
        }
    }

    fn submit(&self, _shared: &Shared, pool: &ThreadPool<Task>, task: Task) -> Action {
        match pool.submit(task) {
            Ok(()) => Action::Extend,
            Err(task) => Action::Retry(task),
        }
    }

    fn run(&self, shared: &Shared, task: Task) {
        let Some(slot) = shared.table.slot(task.fd) else {
            return;
        };
        // SAFETY: the loop handed this connection over with the task.
        let Some(conn) = (unsafe { shared.table.conn_mut(task.fd) }) else {
            return;
        };
        let next = shared.process(conn);

        // Nothing below may touch `conn`. Arm before release so the sweep
        // still sees the connection as held until the socket is live again.
        let ready = match next {
            Next::Read => Ready::Read,
            Next::Write => Ready::Write,
            Next::Close => {
                // the loop evicts when it sees the write event
                slot.close.store(true, Ordering::Release);
                Ready::Write
            }
        };
        shared.arm(task.fd, ready);
        slot.processing.store(false, Ordering::Release);
    }
}

// ---- Worker drives I/O ----

pub struct WorkerDrivesIo;

impl WorkerDrivesIo {
    /// Spin until the worker reports back for `slot`.
    fn await_done(slot: &Slot) {
        spin_until(|| slot.done.load(Ordering::Acquire));
    }

    fn finish(slot: &Slot, shared: &Shared, fd: c_int, arm: Option<Ready>) {
        match arm {
            Some(ready) => shared.arm(fd, ready),
            None => slot.close.store(true, Ordering::Release),
        }
        slot.processing.store(false, Ordering::Release);
        slot.done.store(true, Ordering::Release);
    }
}

impl Dispatcher for WorkerDrivesIo {
    fn mode(&self) -> DispatchMode {
        DispatchMode::WorkerDrivesIo
    }

    fn on_readable(&self, shared: &Shared, pool: &ThreadPool<Task>, fd: c_int) -> Action {
        self.submit(
            shared,
            pool,
            Task {
                fd,
                kind: TaskKind::Read,
            },
        )
    }

    fn on_writable(&self, shared: &Shared, pool: &ThreadPool<Task>, fd: c_int) -> Action {
        let Some(slot) = slot(shared, fd) else {
            return Action::Evict;
        };
        if slot.close.load(Ordering::Acquire) {
            return Action::Evict;
        }
        self.submit(
            shared,
            pool,
            Task {
                fd,
                kind: TaskKind::Write,
            },
        )
    }

    fn submit(&self, shared: &Shared, pool: &ThreadPool<Task>, task: Task) -> Action {
        let Some(slot) = slot(shared, task.fd) else {
            return Action::Evict;
        };
        slot.done.store(false, Ordering::Release);
        slot.close.store(false, Ordering::Release);
        slot.processing.store(true, Ordering::Release);
        if let Err(task) = pool.submit(task) {
            return Action::Retry(task);
        }

        Self::await_done(slot);
        if slot.close.load(Ordering::Acquire) {
            Action::Evict
        } else {
            Action::Extend
        }
    }

    fn run(&self, shared: &Shared, task: Task) {
        let Some(slot) = shared.table.slot(task.fd) else {
            return;
        };
        // SAFETY: the loop handed this connection over with the task.
        let Some(conn) = (unsafe { shared.table.conn_mut(task.fd) }) else {
            slot.done.store(true, Ordering::Release);
            return;
        };

        let arm = match task.kind {
            TaskKind::Read | TaskKind::Process => {
                if task.kind == TaskKind::Read && !conn.read_once() {
                    None
                } else {
                    match shared.process(conn) {
                        Next::Read => Some(Ready::Read),
                        Next::Write => Some(Ready::Write),
                        Next::Close => None,
                    }
                }
            }
            TaskKind::Write => match shared.flush(conn) {
                Flush::Pending => Some(Ready::Write),
                Flush::Done { keep_alive: true } => Some(Ready::Read),
                Flush::Done { keep_alive: false } | Flush::Failed => None,
            },
        };
        Self::finish(slot, shared, task.fd, arm);
    }
}
