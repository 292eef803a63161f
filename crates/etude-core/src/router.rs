// src/router.rs
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::http::{HttpCode, pages};
use crate::parser::Request;
use crate::users::{Registration, UserCache};

/// Where a completed request ended up.
pub struct Resolved {
    pub code: HttpCode,
    pub path: PathBuf,
    /// Read-only mapping; `None` for zero-length files and errors.
    pub file: Option<Mmap>,
}

impl Resolved {
    fn error(code: HttpCode, path: PathBuf) -> Self {
        Self {
            code,
            path,
            file: None,
        }
    }
}

/// Maps request targets to files under the document root and runs the
/// login/registration workflows behind routes `2` and `3`.
pub struct Router {
    doc_root: PathBuf,
    users: Arc<UserCache>,
}

impl Router {
    pub fn new(doc_root: impl Into<PathBuf>, users: Arc<UserCache>) -> Self {
        Self {
            doc_root: doc_root.into(),
            users,
        }
    }

    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }

    pub fn users(&self) -> &UserCache {
        &self.users
    }

    pub fn resolve(&self, req: &Request, body: &[u8], db: &mut dyn Database) -> Resolved {
        let url = req.url.as_str();
        let flag = route_flag(url);

        let target = match flag {
            Some(b'2' | b'3') if req.has_body => self.credentials(flag == Some(b'3'), body, db),
            Some(b'0') => pages::REGISTER,
            Some(b'1') => pages::LOGIN,
            Some(b'5') => pages::PICTURE,
            Some(b'6') => pages::VIDEO,
            Some(b'7') => pages::FANS,
            _ => url,
        };

        let path = self.doc_root.join(target.trim_start_matches('/'));
        stat_and_map(path)
    }

    fn credentials(&self, register: bool, body: &[u8], db: &mut dyn Database) -> &'static str {
        let Some((name, password)) = extract_credentials(body) else {
            debug!("unparseable credential form");
            return if register {
                pages::REGISTER_ERROR
            } else {
                pages::LOGIN_ERROR
            };
        };

        if register {
            match self.users.register(name, password, db) {
                Registration::Created => {
                    info!("registered user {:?}", name);
                    pages::LOGIN
                }
                Registration::Duplicate | Registration::Failed => pages::REGISTER_ERROR,
            }
        } else if self.users.verify(name, password) {
            pages::WELCOME
        } else {
            pages::LOGIN_ERROR
        }
    }
}

/// First byte of the last path segment.
fn route_flag(url: &str) -> Option<u8> {
    let slash = url.rfind('/')?;
    url.as_bytes().get(slash + 1).copied()
}

/// Pull `name` and `password` out of a `user=<name>&password=<pw>` body.
///
/// Field positions are fixed: the name starts at offset 5 and runs to the
/// first `&`, the password starts 10 bytes after that `&` and runs to the end.
pub fn extract_credentials(body: &[u8]) -> Option<(&str, &str)> {
    const NAME_OFFSET: usize = 5;
    const PASSWORD_SKIP: usize = 10;

    let rest = body.get(NAME_OFFSET..)?;
    let amp = NAME_OFFSET + rest.iter().position(|&b| b == b'&')?;
    let name = std::str::from_utf8(&body[NAME_OFFSET..amp]).ok()?;
    let password = std::str::from_utf8(body.get(amp + PASSWORD_SKIP..)?).ok()?;
    let password = password.trim_end_matches('\0');
    if name.is_empty() || password.is_empty() {
        return None;
    }
    Some((name, password))
}

fn stat_and_map(path: PathBuf) -> Resolved {
    let meta = match fs::metadata(&path) {
        Ok(meta) => meta,
        Err(_) => return Resolved::error(HttpCode::NoResource, path),
    };
    if meta.permissions().mode() & 0o004 == 0 {
        return Resolved::error(HttpCode::Forbidden, path);
    }
    if meta.is_dir() {
        return Resolved::error(HttpCode::BadRequest, path);
    }
    if meta.len() == 0 {
        return Resolved {
            code: HttpCode::FileRequest,
            path,
            file: None,
        };
    }

    match map_file(&path) {
        Ok(map) => Resolved {
            code: HttpCode::FileRequest,
            path,
            file: Some(map),
        },
        Err(e) => {
            warn!("mmap {} failed: {}", path.display(), e);
            Resolved::error(HttpCode::InternalError, path)
        }
    }
}

fn map_file(path: &Path) -> io::Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only; files under the document root are
    // not truncated while being served.
    unsafe { Mmap::map(&file) }
}
