// src/main.rs
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use etude_core::logging::{DEFAULT_QUEUE_CAPACITY, DEFAULT_SPLIT_LINES};
use etude_core::{
    ConnectionPool, DbConfig, DispatchMode, Linger, LogConfig, LogMode, Server, ServerConfig,
    TriggerMode, init_logging,
};
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "etude")]
#[command(about = "Epoll-driven static file and login server")]
#[command(version)]
struct Cli {
    /// Listen port
    #[arg(short = 'p', long, env = "ETUDE_PORT", default_value_t = 9006)]
    port: u16,

    /// Log write mode: 0 synchronous, 1 asynchronous
    #[arg(short = 'l', long = "log-write", env = "ETUDE_LOG_WRITE", default_value_t = 0)]
    log_write: u8,

    /// Trigger mode (listener/connection): 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET
    #[arg(short = 'm', long = "trig-mode", env = "ETUDE_TRIG_MODE", default_value_t = 0)]
    trig_mode: u8,

    /// Linger on close: 0 abrupt, 1 graceful
    #[arg(short = 'o', long = "opt-linger", env = "ETUDE_OPT_LINGER", default_value_t = 0)]
    opt_linger: u8,

    /// Database pool size (overrides the config file)
    #[arg(short = 's', long = "sql-num", env = "ETUDE_SQL_NUM")]
    sql_num: Option<usize>,

    /// Worker threads
    #[arg(short = 't', long = "thread-num", env = "ETUDE_THREAD_NUM", default_value_t = 8)]
    thread_num: usize,

    /// Close log: 0 logging on, 1 logging off
    #[arg(short = 'c', long = "close-log", env = "ETUDE_CLOSE_LOG", default_value_t = 0)]
    close_log: u8,

    /// Dispatch mode: 0 loop performs I/O, 1 workers perform I/O
    #[arg(short = 'a', long = "actor-model", env = "ETUDE_ACTOR_MODEL", default_value_t = 0)]
    actor_model: u8,

    /// Document root
    #[arg(long, env = "ETUDE_ROOT", default_value = "root")]
    root: PathBuf,

    /// Database config file (JSON)
    #[arg(long = "db-config", env = "ETUDE_DB_CONFIG", default_value = "etude-db.json")]
    db_config: PathBuf,

    #[arg(long = "max-connections", env = "ETUDE_MAX_CONNECTIONS", default_value_t = 65_536)]
    max_connections: usize,

    /// Task queue depth
    #[arg(long = "max-requests", env = "ETUDE_MAX_REQUESTS", default_value_t = 10_000)]
    max_requests: usize,

    /// Idle sweep interval in seconds
    #[arg(long, env = "ETUDE_TIMESLOT", default_value_t = 5)]
    timeslot: u64,

    /// Log file directory and base name
    #[arg(long = "log-path", env = "ETUDE_LOG_PATH", default_value = "./ServerLog")]
    log_path: PathBuf,

    /// Level filter used when RUST_LOG is unset
    #[arg(long = "log-level", env = "ETUDE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Pin each worker to a CPU core
    #[arg(long = "pin-workers", env = "ETUDE_PIN_WORKERS")]
    pin_workers: bool,
}

/// Database pool size when neither `-s` nor the config file give one.
const DEFAULT_DB_POOL: usize = 8;

impl Cli {
    fn server_config(&self) -> Result<ServerConfig> {
        Ok(ServerConfig {
            port: self.port,
            doc_root: self.root.clone(),
            trigger_mode: TriggerMode::try_from(self.trig_mode)?,
            dispatch: DispatchMode::try_from(self.actor_model)?,
            linger: Linger::try_from(self.opt_linger)?,
            worker_threads: self.thread_num,
            max_requests: self.max_requests,
            max_connections: self.max_connections,
            timeslot: Duration::from_secs(self.timeslot),
            pin_workers: self.pin_workers,
        })
    }

    fn log_config(&self) -> Result<LogConfig> {
        let mode = match self.log_write {
            0 => LogMode::Sync,
            1 => LogMode::Async {
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
            },
            v => anyhow::bail!("log write mode {} not in 0..=1", v),
        };
        let enabled = match self.close_log {
            0 => true,
            1 => false,
            v => anyhow::bail!("close log flag {} not in 0..=1", v),
        };
        Ok(LogConfig {
            enabled,
            mode,
            path: self.log_path.clone(),
            split_lines: DEFAULT_SPLIT_LINES,
            level: self.log_level.clone(),
        })
    }

    /// `-s` wins over the file, the file over the default.
    fn db_pool_size(&self, db: &DbConfig) -> usize {
        self.sql_num.or(db.pool_size).unwrap_or(DEFAULT_DB_POOL)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Validate modes before anything touches the filesystem
    let config = cli.server_config().context("invalid server options")?;
    let log_config = cli.log_config().context("invalid logging options")?;

    // 2. Logging
    let _log_guard = init_logging(&log_config).context("failed to start logging")?;

    // 3. Database
    let db_config = DbConfig::load(&cli.db_config)
        .with_context(|| format!("failed to read {}", cli.db_config.display()))?;
    let pool_size = cli.db_pool_size(&db_config);
    let db = ConnectionPool::connect(&db_config, pool_size)
        .context("failed to open the database pool")?;

    if config.pin_workers && config.worker_threads > num_cpus::get() {
        warn!(
            "{} workers on {} CPUs: pinned workers will share cores",
            config.worker_threads,
            num_cpus::get()
        );
    }

    // 4. Serve
    let mut server = Server::new(config, db).context("failed to start server")?;
    info!("etude listening on {}", server.local_addr());
    server.run().context("event loop failed")?;
    info!("etude shut down cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("etude").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn short_flags_map_to_modes() {
        let cli = parse(&["-p", "8080", "-m", "3", "-a", "1", "-o", "1", "-t", "2"]);
        let config = cli.server_config().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.trigger_mode, TriggerMode::EtEt);
        assert_eq!(config.dispatch, DispatchMode::WorkerDrivesIo);
        assert!(config.linger.enabled());
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.timeslot, Duration::from_secs(5));
    }

    #[test]
    fn out_of_range_modes_are_rejected() {
        assert!(parse(&["-m", "4"]).server_config().is_err());
        assert!(parse(&["-a", "2"]).server_config().is_err());
        assert!(parse(&["-l", "2"]).log_config().is_err());
        assert!(parse(&["-c", "3"]).log_config().is_err());
    }

    #[test]
    fn log_flags() {
        let log = parse(&["-l", "1", "-c", "1"]).log_config().unwrap();
        assert!(!log.enabled);
        assert_eq!(
            log.mode,
            LogMode::Async {
                queue_capacity: DEFAULT_QUEUE_CAPACITY
            }
        );
    }

    #[test]
    fn pool_size_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(&path, r#"{"backend": "memory", "pool_size": 3}"#).unwrap();
        let db = DbConfig::load(&path).unwrap();

        assert_eq!(parse(&[]).db_pool_size(&db), 3);
        assert_eq!(parse(&["-s", "5"]).db_pool_size(&db), 5);
        assert_eq!(parse(&[]).db_pool_size(&DbConfig::default()), DEFAULT_DB_POOL);
    }
}
