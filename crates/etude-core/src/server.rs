// src/server.rs
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use libc::c_int;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::db::ConnectionPool;
use crate::dispatch::{self, Action, Dispatcher, Shared, Task};
use crate::error::{EtudeError, EtudeResult};
use crate::http::BUSY_MESSAGE;
use crate::metrics::ServerMetrics;
use crate::pool::ThreadPool;
use crate::router::Router;
use crate::signal::{ShutdownHandle, SignalPipe};
use crate::syscalls::{
    self, Epoll, HANGUP_MASK, READABLE, Ready, WRITABLE, conn_interest, empty_events,
    plain_interest,
};
use crate::table::ConnTable;
use crate::timer::ConnTimers;
use crate::users::UserCache;

const MAX_EVENTS: usize = 10_000;
/// Slots pre-sized regardless of the admission limit, since fds are used
/// as indices.
const MIN_TABLE_SLOTS: usize = 65_536;
/// Multiplexer timeout while tasks wait for queue space.
const RETRY_WAIT_MS: i32 = 10;

pub struct Server {
    config: ServerConfig,
    shared: Arc<Shared>,
    dispatcher: Arc<dyn Dispatcher>,
    pool: ThreadPool<Task>,
    listener: OwnedFd,
    signals: SignalPipe,
    timers: ConnTimers,
    pending: VecDeque<Task>,
    local_addr: SocketAddr,
    users: Arc<UserCache>,
    stopped: bool,
}

impl Server {
    /// Bind, register and spawn everything. Nothing is served until
    /// [`Server::run`].
    pub fn new(config: ServerConfig, db: ConnectionPool) -> EtudeResult<Self> {
        config.validate()?;

        // 1. Credential cache
        let users = Arc::new(UserCache::new());
        users.load_from(&mut *db.acquire())?;

        // 2. Signals
        let signals = SignalPipe::install().map_err(|e| EtudeError::startup("signal setup", e))?;

        // 3. Listener
        let raw = syscalls::create_listen_socket(config.port, config.linger.enabled())
            .map_err(|e| EtudeError::startup("bind", e))?;
        // SAFETY: freshly created and owned by nobody else.
        let listener = unsafe { OwnedFd::from_raw_fd(raw) };
        let local_addr = SocketAddr::V4(
            syscalls::local_addr(listener.as_raw_fd())
                .map_err(|e| EtudeError::startup("getsockname", e))?,
        );

        // 4. Multiplexer
        let epoll = Epoll::new().map_err(|e| EtudeError::startup("epoll_create", e))?;
        epoll
            .add(
                listener.as_raw_fd(),
                plain_interest(config.trigger_mode.listen_edge()),
            )
            .map_err(|e| EtudeError::startup("register listener", e))?;
        epoll
            .add(signals.read_fd(), plain_interest(false))
            .map_err(|e| EtudeError::startup("register signal pipe", e))?;

        // 5. Workers
        let capacity = config.max_connections.max(MIN_TABLE_SLOTS);
        let shared = Arc::new(Shared {
            table: ConnTable::new(capacity),
            epoll,
            router: Router::new(config.doc_root.clone(), users.clone()),
            db,
            metrics: Arc::new(ServerMetrics::new()),
            conn_edge: config.trigger_mode.conn_edge(),
        });
        let dispatcher = dispatch::select(config.dispatch);
        let pool = {
            let shared = shared.clone();
            let dispatcher = dispatcher.clone();
            ThreadPool::spawn(
                config.worker_threads,
                config.max_requests,
                config.pin_workers,
                move |task| dispatcher.run(&shared, task),
            )?
        };

        info!(
            "listening on {} ({:?}, {:?}, {} workers)",
            local_addr, config.trigger_mode, config.dispatch, config.worker_threads
        );
        Ok(Self {
            config,
            shared,
            dispatcher,
            pool,
            listener,
            signals,
            timers: ConnTimers::new(capacity),
            pending: VecDeque::new(),
            local_addr,
            users,
            stopped: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.signals.shutdown_handle()
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.shared.metrics.clone()
    }

    pub fn users(&self) -> &Arc<UserCache> {
        &self.users
    }

    /// Serve until `SIGTERM`/`SIGINT` or a [`ShutdownHandle`] fires.
    pub fn run(&mut self) -> EtudeResult<()> {
        let timeslot = self.timeslot_secs();
        let listen_fd = self.listener.as_raw_fd();
        let pipe_fd = self.signals.read_fd();
        let mut events = empty_events(MAX_EVENTS);

        syscalls::alarm(timeslot);
        let result = loop {
            let timeout = if self.pending.is_empty() { -1 } else { RETRY_WAIT_MS };
            let n = match self.shared.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(e) => {
                    error!("epoll wait failed: {}", e);
                    break Err(EtudeError::Io(e));
                }
            };

            let mut sweep = false;
            let mut stop = false;
            for ev in &events[..n] {
                // packed struct: copy out
                let fd = ev.u64 as c_int;
                let flags = ev.events;

                if fd == listen_fd {
                    self.accept_ready();
                } else if fd == pipe_fd {
                    let got = self.signals.drain();
                    sweep |= got.sweep;
                    stop |= got.stop;
                } else {
                    self.shared.settle(fd);
                    if flags & HANGUP_MASK != 0 {
                        self.close_conn(fd);
                    } else if flags & READABLE != 0 {
                        let action = self.dispatcher.on_readable(&self.shared, &self.pool, fd);
                        self.apply(fd, action);
                    } else if flags & WRITABLE != 0 {
                        let action = self.dispatcher.on_writable(&self.shared, &self.pool, fd);
                        self.apply(fd, action);
                    }
                }
            }

            self.resubmit_pending();

            if sweep {
                self.sweep(Instant::now());
                syscalls::alarm(timeslot);
            }
            if stop {
                info!("shutdown requested");
                break Ok(());
            }
        };

        self.stop();
        result
    }

    fn timeslot_secs(&self) -> u32 {
        u32::try_from(self.config.timeslot.as_secs()).unwrap_or(u32::MAX)
    }

    fn accept_ready(&mut self) {
        let listen_fd = self.listener.as_raw_fd();
        loop {
            match syscalls::accept_connection(listen_fd) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
            if !self.config.trigger_mode.listen_edge() {
                break;
            }
        }
    }

    fn admit(&mut self, fd: c_int, peer: std::net::SocketAddrV4) {
        let at_limit = self.shared.metrics.active() >= self.config.max_connections;
        if at_limit || self.shared.table.slot(fd).is_none() {
            warn!("rejecting {}: server busy", peer);
            self.shared.metrics.inc_rejected();
            syscalls::send_and_forget(fd, BUSY_MESSAGE);
            syscalls::close(fd);
            return;
        }

        // SAFETY: a fresh fd is not registered anywhere yet.
        let Some(conn) = (unsafe { self.shared.table.conn_mut(fd) }) else {
            syscalls::close(fd);
            return;
        };
        conn.init(fd, peer, self.shared.conn_edge);
        if let Some(slot) = self.shared.table.slot(fd) {
            slot.clear_flags();
        }

        let deadline = Instant::now() + self.config.idle_timeout();
        self.timers.track(fd, deadline);
        self.shared.metrics.inc_conn();

        if let Err(e) = self
            .shared
            .epoll
            .add(fd, conn_interest(Ready::Read, self.shared.conn_edge))
        {
            error!("register fd {} failed: {}", fd, e);
            self.close_conn(fd);
            return;
        }
        debug!("accepted {} on fd {}", peer, fd);
    }

    fn apply(&mut self, fd: c_int, action: Action) {
        match action {
            Action::Extend => self.extend(fd),
            Action::Evict => {
                self.close_conn(fd);
            }
            Action::Retry(task) => {
                debug!("task queue full, holding fd {}", task.fd);
                self.shared.metrics.inc_retry();
                self.extend(fd);
                self.pending.push_back(task);
            }
        }
    }

    fn extend(&mut self, fd: c_int) {
        let deadline = Instant::now() + self.config.idle_timeout();
        self.timers.extend(fd, deadline);
    }

    fn resubmit_pending(&mut self) {
        for _ in 0..self.pending.len() {
            let Some(task) = self.pending.pop_front() else {
                break;
            };
            match self.dispatcher.submit(&self.shared, &self.pool, task) {
                Action::Retry(task) => {
                    // still full; keep order and try next turn
                    self.pending.push_front(task);
                    break;
                }
                action => self.apply(task.fd, action),
            }
        }
    }

    /// Evict every connection past its deadline. Connections with work in
    /// flight get one more timeout instead.
    fn sweep(&mut self, now: Instant) {
        let mut evicted = 0usize;
        while let Some(fd) = self.timers.pop_expired(now) {
            let busy = self
                .shared
                .table
                .slot(fd)
                .is_some_and(|s| s.processing.load(Ordering::Acquire));
            if busy {
                self.timers.track(fd, now + self.config.idle_timeout());
                continue;
            }
            if self.close_conn(fd) {
                self.shared.metrics.inc_evicted();
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!("sweep evicted {} idle connections", evicted);
        }
    }

    /// Tear down one connection. Only the first call per admission does
    /// anything; later ones return `false`.
    fn close_conn(&mut self, fd: c_int) -> bool {
        if !self.timers.release(fd) {
            return false;
        }

        if let Err(e) = self.shared.epoll.delete(fd) {
            debug!("deregister fd {} failed: {}", fd, e);
        }
        // SAFETY: the loop owns fds that are neither armed nor queued.
        if let Some(conn) = unsafe { self.shared.table.conn_mut(fd) } {
            conn.close();
        }
        syscalls::close(fd);
        if let Some(slot) = self.shared.table.slot(fd) {
            slot.clear_flags();
        }
        self.shared.metrics.dec_conn();
        debug!("closed fd {}", fd);
        true
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        syscalls::alarm(0);

        // workers finish whatever is queued before connections go away
        self.pending.clear();
        self.pool.shutdown();

        for fd in self.timers.tracked() {
            self.close_conn(fd);
        }
        info!("server stopped: {:?}", self.shared.metrics.snapshot());
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
