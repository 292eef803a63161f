// src/error.rs
use std::io;

use thiserror::Error;

use crate::db::DbError;

/// Central error type for the etude engine.
///
/// Only startup and teardown paths produce these. Per-connection failures
/// are resolved on the spot (close, respond-then-close, log-and-continue).
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A setup syscall failed (socket, bind, epoll_create, sigaction, ...).
    #[error("{step} failed: {source}")]
    Startup {
        step: &'static str,
        #[source]
        source: io::Error,
    },
    /// Credential database failure.
    #[error("database error: {0}")]
    Db(#[from] DbError),
    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Logger could not be set up.
    #[error("logging error: {0}")]
    Log(String),
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker {index}: {source}")]
    WorkerSpawn {
        index: usize,
        #[source]
        source: io::Error,
    },
}

impl EtudeError {
    pub(crate) fn startup(step: &'static str, source: io::Error) -> Self {
        EtudeError::Startup { step, source }
    }
}

pub type EtudeResult<T> = Result<T, EtudeError>;
