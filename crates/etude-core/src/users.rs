// src/users.rs
use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::db::{Database, DbError, DbResult};
use crate::sync::lock;

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Duplicate,
    Failed,
}

/// Username → password map shared by every worker.
///
/// Every access takes the lock, so the check-then-act sequences in
/// [`verify`](Self::verify) and [`register`](Self::register) are atomic.
#[derive(Default)]
pub struct UserCache {
    users: Mutex<HashMap<String, String>>,
}

impl UserCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every row from the store. Called once at startup.
    pub fn load_from(&self, db: &mut dyn Database) -> DbResult<usize> {
        let rows = db.load_users()?;
        let n = rows.len();
        self.populate(rows);
        info!("loaded {} users", n);
        Ok(n)
    }

    pub fn populate<I>(&self, rows: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        lock(&self.users).extend(rows);
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        lock(&self.users).get(name).cloned()
    }

    pub fn verify(&self, name: &str, password: &str) -> bool {
        lock(&self.users)
            .get(name)
            .is_some_and(|stored| stored == password)
    }

    /// Insert if absent, writing through to `db` while the lock is held.
    pub fn register(&self, name: &str, password: &str, db: &mut dyn Database) -> Registration {
        let mut users = lock(&self.users);
        if users.contains_key(name) {
            return Registration::Duplicate;
        }
        match db.insert_user(name, password) {
            Ok(()) => {
                users.insert(name.to_owned(), password.to_owned());
                Registration::Created
            }
            Err(DbError::Duplicate(_)) => Registration::Duplicate,
            Err(e) => {
                warn!("registration of {:?} failed: {}", name, e);
                Registration::Failed
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.users).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
