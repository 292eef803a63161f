// src/lib.rs
pub mod block_queue;
pub mod config;
pub mod conn;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod router;
pub mod server;
pub mod signal;
pub mod sync;
pub mod syscalls;
pub mod table;
pub mod timer;
pub mod users;

// Re-exports for users
pub use config::{DispatchMode, Linger, ServerConfig, TriggerMode};
pub use db::{Backend, ConnectionPool, Database, DbConfig, DbError, FileDatabase, MemoryDatabase};
pub use error::{EtudeError, EtudeResult};
pub use logging::{LogConfig, LogGuard, LogMode, init_logging};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use server::Server;
pub use signal::ShutdownHandle;
pub use users::{Registration, UserCache};
