// src/config.rs
use std::path::PathBuf;
use std::time::Duration;

use crate::error::EtudeError;

/// Level/edge triggering for the listener and for connection sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    #[default]
    LtLt,
    LtEt,
    EtLt,
    EtEt,
}

impl TriggerMode {
    pub fn listen_edge(self) -> bool {
        matches!(self, TriggerMode::EtLt | TriggerMode::EtEt)
    }

    pub fn conn_edge(self) -> bool {
        matches!(self, TriggerMode::LtEt | TriggerMode::EtEt)
    }
}

impl TryFrom<u8> for TriggerMode {
    type Error = EtudeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(TriggerMode::LtLt),
            1 => Ok(TriggerMode::LtEt),
            2 => Ok(TriggerMode::EtLt),
            3 => Ok(TriggerMode::EtEt),
            _ => Err(EtudeError::Config(format!("trigger mode {} not in 0..=3", v))),
        }
    }
}

/// Who performs socket I/O for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// The loop reads and writes; workers only parse and respond.
    #[default]
    LoopDrivesIo,
    /// Workers read and write themselves.
    WorkerDrivesIo,
}

impl TryFrom<u8> for DispatchMode {
    type Error = EtudeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(DispatchMode::LoopDrivesIo),
            1 => Ok(DispatchMode::WorkerDrivesIo),
            _ => Err(EtudeError::Config(format!("dispatch mode {} not in 0..=1", v))),
        }
    }
}

/// `SO_LINGER` policy on the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Linger {
    #[default]
    Abrupt,
    Graceful,
}

impl Linger {
    pub fn enabled(self) -> bool {
        self == Linger::Graceful
    }
}

impl TryFrom<u8> for Linger {
    type Error = EtudeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Linger::Abrupt),
            1 => Ok(Linger::Graceful),
            _ => Err(EtudeError::Config(format!("linger mode {} not in 0..=1", v))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub doc_root: PathBuf,
    pub trigger_mode: TriggerMode,
    pub dispatch: DispatchMode,
    pub linger: Linger,
    pub worker_threads: usize,
    /// Task queue depth.
    pub max_requests: usize,
    /// Connection table capacity and admission limit.
    pub max_connections: usize,
    /// Sweep interval. Idle connections live three of these.
    pub timeslot: Duration,
    pub pin_workers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9006,
            doc_root: PathBuf::from("root"),
            trigger_mode: TriggerMode::default(),
            dispatch: DispatchMode::default(),
            linger: Linger::default(),
            worker_threads: 8,
            max_requests: 10_000,
            max_connections: 65_536,
            timeslot: Duration::from_secs(5),
            pin_workers: false,
        }
    }
}

impl ServerConfig {
    /// Idle lifetime granted on accept and on every bit of activity.
    pub fn idle_timeout(&self) -> Duration {
        self.timeslot * 3
    }

    pub fn validate(&self) -> Result<(), EtudeError> {
        if self.worker_threads == 0 {
            return Err(EtudeError::Config("worker_threads must be at least 1".into()));
        }
        if self.max_requests == 0 {
            return Err(EtudeError::Config("max_requests must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(EtudeError::Config("max_connections must be at least 1".into()));
        }
        if self.timeslot.as_secs() == 0 {
            return Err(EtudeError::Config("timeslot must be at least one second".into()));
        }
        if !self.doc_root.is_dir() {
            return Err(EtudeError::Config(format!(
                "document root {} is not a directory",
                self.doc_root.display()
            )));
        }
        Ok(())
    }
}
