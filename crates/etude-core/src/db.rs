// src/db.rs
//! Credential store handles and the fixed-size pool they are checked out of.
//!
//! Handles are created eagerly when the pool is built; a failure there is a
//! startup error. Workers borrow one through [`ConnectionPool::acquire`]
//! and the guard puts it back on every exit path.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::sync::{Semaphore, lock};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed credential data: {0}")]
    Serde(#[from] serde_json::Error),
    /// Username already present.
    #[error("user {0:?} already exists")]
    Duplicate(String),
    #[error("invalid database configuration: {0}")]
    Config(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// One connection to the credential store.
pub trait Database: Send {
    /// Every `(username, password)` row.
    fn load_users(&mut self) -> DbResult<Vec<(String, String)>>;

    /// Add a row. An existing username is [`DbError::Duplicate`].
    fn insert_user(&mut self, name: &str, password: &str) -> DbResult<()>;
}

// ---- Backends ----

/// In-process table. Clones share the same rows.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    rows: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users<I, K, V>(users: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let rows = users
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            rows: Arc::new(Mutex::new(rows)),
        }
    }
}

impl Database for MemoryDatabase {
    fn load_users(&mut self) -> DbResult<Vec<(String, String)>> {
        Ok(lock(&self.rows)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn insert_user(&mut self, name: &str, password: &str) -> DbResult<()> {
        let mut rows = lock(&self.rows);
        if rows.contains_key(name) {
            return Err(DbError::Duplicate(name.to_owned()));
        }
        rows.insert(name.to_owned(), password.to_owned());
        Ok(())
    }
}

/// JSON file of `{username: password}`. Clones share one write lock so
/// concurrent inserts never lose rows.
#[derive(Clone)]
pub struct FileDatabase {
    path: Arc<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl FileDatabase {
    pub fn open(path: impl Into<PathBuf>) -> DbResult<Self> {
        let path = path.into();
        if !path.exists() {
            write_atomic(&path, &BTreeMap::new())?;
            info!("created credential file {}", path.display());
        } else {
            // surface a corrupt file at startup rather than on first insert
            read_rows(&path)?;
        }
        Ok(Self {
            path: Arc::new(path),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Database for FileDatabase {
    fn load_users(&mut self) -> DbResult<Vec<(String, String)>> {
        let _guard = lock(&self.write_lock);
        Ok(read_rows(&self.path)?.into_iter().collect())
    }

    fn insert_user(&mut self, name: &str, password: &str) -> DbResult<()> {
        let _guard = lock(&self.write_lock);
        let mut rows = read_rows(&self.path)?;
        if rows.contains_key(name) {
            return Err(DbError::Duplicate(name.to_owned()));
        }
        rows.insert(name.to_owned(), password.to_owned());
        write_atomic(&self.path, &rows)
    }
}

fn read_rows(path: &Path) -> DbResult<BTreeMap<String, String>> {
    let bytes = fs::read(path)?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, rows: &BTreeMap<String, String>) -> DbResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, rows)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

// ---- Configuration ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum Backend {
    File { path: PathBuf },
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(flatten)]
    pub backend: Backend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            backend: Backend::File {
                path: PathBuf::from("users.json"),
            },
            pool_size: None,
        }
    }
}

impl DbConfig {
    pub fn from_json(text: &str) -> DbResult<Self> {
        let config: DbConfig = serde_json::from_str(text)?;
        if config.pool_size == Some(0) {
            return Err(DbError::Config("pool_size must be at least 1".into()));
        }
        Ok(config)
    }

    /// Read a config file. A missing file yields the default file backend.
    pub fn load(path: &Path) -> DbResult<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no database config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ---- Pool ----

/// Fixed set of handles guarded by a semaphore counting the free ones.
pub struct ConnectionPool {
    free: Mutex<Vec<Box<dyn Database>>>,
    available: Semaphore,
    size: usize,
}

impl ConnectionPool {
    pub fn new(handles: Vec<Box<dyn Database>>) -> Self {
        let size = handles.len();
        Self {
            free: Mutex::new(handles),
            available: Semaphore::new(size),
            size,
        }
    }

    /// Open `size` handles for the configured backend.
    pub fn connect(config: &DbConfig, size: usize) -> DbResult<Self> {
        if size == 0 {
            return Err(DbError::Config("pool size must be at least 1".into()));
        }
        let mut handles: Vec<Box<dyn Database>> = Vec::with_capacity(size);
        match &config.backend {
            Backend::Memory => {
                let shared = MemoryDatabase::new();
                for _ in 0..size {
                    handles.push(Box::new(shared.clone()));
                }
            }
            Backend::File { path } => {
                let shared = FileDatabase::open(path)?;
                for _ in 0..size {
                    handles.push(Box::new(shared.clone()));
                }
            }
        }
        info!("database pool ready: {} handles", size);
        Ok(Self::new(handles))
    }

    /// Block until a handle is free.
    pub fn acquire(&self) -> PooledConnection<'_> {
        loop {
            self.available.wait();
            // a permit always has a handle behind it
            if let Some(conn) = lock(&self.free).pop() {
                return PooledConnection {
                    pool: self,
                    conn: ManuallyDrop::new(conn),
                };
            }
        }
    }

    pub fn free_count(&self) -> usize {
        lock(&self.free).len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn release(&self, conn: Box<dyn Database>) {
        lock(&self.free).push(conn);
        self.available.post();
    }
}

/// Checked-out handle, returned to the pool on drop.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: ManuallyDrop<Box<dyn Database>>,
}

impl Deref for PooledConnection<'_> {
    type Target = dyn Database;

    fn deref(&self) -> &Self::Target {
        &**self.conn
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.conn
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        // SAFETY: `conn` is never touched again after this take.
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        self.pool.release(conn);
    }
}
