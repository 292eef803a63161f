// src/conn.rs
//! Per-connection HTTP state: fixed read and header buffers, the request
//! parser, and the pending response (header bytes plus an optional mapped
//! file) with its scatter-write progress.
//!
//! Nothing in here locks. Exclusive access comes from one-shot readiness:
//! whoever handles an event for this socket owns the connection until the
//! socket is re-armed.

use std::fmt::{self, Write as _};
use std::io::{self, IoSlice};
use std::net::SocketAddrV4;
use std::path::PathBuf;

use arrayvec::ArrayVec;
use libc::c_int;
use memmap2::Mmap;
use tracing::{debug, info};

use crate::db::Database;
use crate::http::{EMPTY_PAGE, HttpCode, OK_TITLE, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE};
use crate::parser::RequestParser;
use crate::router::Router;
use crate::syscalls;

/// What the caller should arm the socket for after [`HttpConn::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Request incomplete; wait for more bytes.
    Read,
    /// Response staged; wait for write readiness.
    Write,
    /// Response could not be staged; drop the connection.
    Close,
}

/// Result of one [`HttpConn::write`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Socket buffer full; progress kept, arm for write again.
    Pending,
    /// Response fully sent. With `keep_alive` the connection has already
    /// been reset for the next request.
    Done { keep_alive: bool },
    /// Write error; drop the connection.
    Failed,
}

pub struct HttpConn {
    fd: c_int,
    peer: Option<SocketAddrV4>,
    edge: bool,

    read_buf: [u8; READ_BUFFER_SIZE],
    read_idx: usize,
    parser: RequestParser,

    write_buf: ArrayVec<u8, WRITE_BUFFER_SIZE>,
    keep_alive: bool,
    real_file: PathBuf,
    file: Option<Mmap>,
    bytes_to_send: usize,
    bytes_have_send: usize,
}

impl Default for HttpConn {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpConn {
    pub fn new() -> Self {
        Self {
            fd: -1,
            peer: None,
            edge: false,
            read_buf: [0; READ_BUFFER_SIZE],
            read_idx: 0,
            parser: RequestParser::new(),
            write_buf: ArrayVec::new(),
            keep_alive: false,
            real_file: PathBuf::new(),
            file: None,
            bytes_to_send: 0,
            bytes_have_send: 0,
        }
    }

    /// Bind to a freshly accepted socket.
    pub fn init(&mut self, fd: c_int, peer: SocketAddrV4, edge: bool) {
        self.fd = fd;
        self.peer = Some(peer);
        self.edge = edge;
        self.reset();
    }

    /// Back to request-line start, socket untouched.
    pub fn reset(&mut self) {
        self.read_buf.fill(0);
        self.read_idx = 0;
        self.parser.reset();
        self.write_buf.clear();
        self.keep_alive = false;
        self.real_file.clear();
        self.file = None;
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
    }

    /// Release the mapping and forget the socket. The caller closes the fd.
    pub fn close(&mut self) {
        self.file = None;
        self.fd = -1;
        self.peer = None;
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn peer(&self) -> Option<SocketAddrV4> {
        self.peer
    }

    pub fn parser(&self) -> &RequestParser {
        &self.parser
    }

    pub fn read_len(&self) -> usize {
        self.read_idx
    }

    /// Header bytes of the staged response.
    pub fn header(&self) -> &[u8] {
        &self.write_buf
    }

    /// Pull bytes off the socket into the read buffer.
    ///
    /// Level-triggered sockets get one read; edge-triggered ones are drained
    /// until would-block. `false` means the connection is finished: EOF,
    /// error, a full buffer, or (level-triggered) nothing to read.
    pub fn read_once(&mut self) -> bool {
        if self.read_idx >= READ_BUFFER_SIZE {
            return false;
        }

        if !self.edge {
            return match self.read_some() {
                Ok(0) | Err(_) => false,
                Ok(_) => true,
            };
        }

        loop {
            if self.read_idx >= READ_BUFFER_SIZE {
                // drained as far as the buffer allows
                return true;
            }
            match self.read_some() {
                Ok(0) => return false,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(_) => return false,
            }
        }
    }

    fn read_some(&mut self) -> io::Result<usize> {
        loop {
            match syscalls::read(self.fd, &mut self.read_buf[self.read_idx..]) {
                Ok(n) => {
                    self.read_idx += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Copy bytes in as if they had been read from the socket.
    pub fn receive(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(READ_BUFFER_SIZE - self.read_idx);
        self.read_buf[self.read_idx..self.read_idx + n].copy_from_slice(&bytes[..n]);
        self.read_idx += n;
        n
    }

    /// Parse what has been read and, once a request is complete, resolve it
    /// and stage the response.
    pub fn process(&mut self, router: &Router, db: &mut dyn Database) -> Next {
        let code = self.process_read(router, db);
        if code == HttpCode::NoRequest {
            return Next::Read;
        }
        if !self.process_write(code) {
            return Next::Close;
        }
        Next::Write
    }

    fn process_read(&mut self, router: &Router, db: &mut dyn Database) -> HttpCode {
        let code = self.parser.advance(&mut self.read_buf[..self.read_idx]);
        if code != HttpCode::GetRequest {
            return code;
        }

        let req = self.parser.request();
        info!(
            "{} {} from {}",
            req.method.as_str(),
            req.url,
            self.peer.map(|p| p.to_string()).unwrap_or_default()
        );
        self.keep_alive = req.keep_alive;
        let body = &self.read_buf[req.body.clone()];
        let resolved = router.resolve(req, body, db);
        self.real_file = resolved.path;
        self.file = resolved.file;
        resolved.code
    }

    fn process_write(&mut self, code: HttpCode) -> bool {
        self.write_buf.clear();
        self.bytes_have_send = 0;

        if let Some((status, title, form)) = code.error_response() {
            debug!("{} for {}", status, self.real_file.display());
            self.keep_alive = false;
            if self.add_status_line(status, title).is_err()
                || self.add_headers(form.len()).is_err()
                || self.add_content(form).is_err()
            {
                return false;
            }
            self.bytes_to_send = self.write_buf.len();
            return true;
        }

        if code != HttpCode::FileRequest {
            return false;
        }
        if self.add_status_line(200, OK_TITLE).is_err() {
            return false;
        }
        match self.file.as_ref().map(|m| m.len()) {
            Some(file_len) => {
                if self.add_headers(file_len).is_err() {
                    return false;
                }
                self.bytes_to_send = self.write_buf.len() + file_len;
            }
            None => {
                if self.add_headers(EMPTY_PAGE.len()).is_err() || self.add_content(EMPTY_PAGE).is_err() {
                    return false;
                }
                self.bytes_to_send = self.write_buf.len();
            }
        }
        true
    }

    fn add_response(&mut self, args: fmt::Arguments<'_>) -> fmt::Result {
        HeaderWriter(&mut self.write_buf).write_fmt(args)
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> fmt::Result {
        self.add_response(format_args!("HTTP/1.1 {} {}\r\n", status, title))
    }

    fn add_headers(&mut self, content_len: usize) -> fmt::Result {
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        self.add_response(format_args!(
            "Content-Length: {}\r\nConnection: {}\r\n\r\n",
            content_len, connection
        ))
    }

    fn add_content(&mut self, content: &str) -> fmt::Result {
        self.add_response(format_args!("{}", content))
    }

    /// Push the staged response out with `writev`, resuming where the last
    /// attempt stopped.
    pub fn write(&mut self) -> Flush {
        if self.bytes_to_send == 0 {
            self.reset();
            return Flush::Done { keep_alive: true };
        }

        loop {
            let header_len = self.write_buf.len();
            let file: &[u8] = self.file.as_deref().unwrap_or(&[]);
            let sent = self.bytes_have_send;
            let result = if sent >= header_len {
                syscalls::writev(self.fd, &[IoSlice::new(&file[sent - header_len..])])
            } else {
                syscalls::writev(
                    self.fd,
                    &[IoSlice::new(&self.write_buf[sent..]), IoSlice::new(file)],
                )
            };

            match result {
                Ok(0) => {
                    self.file = None;
                    return Flush::Failed;
                }
                Ok(n) => {
                    self.bytes_have_send += n;
                    self.bytes_to_send = self.bytes_to_send.saturating_sub(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flush::Pending,
                Err(e) => {
                    debug!("write to fd {} failed: {}", self.fd, e);
                    self.file = None;
                    return Flush::Failed;
                }
            }

            if self.bytes_to_send == 0 {
                self.file = None;
                if self.keep_alive {
                    self.reset();
                    return Flush::Done { keep_alive: true };
                }
                return Flush::Done { keep_alive: false };
            }
        }
    }

    /// Bytes of the current response written so far.
    pub fn bytes_sent(&self) -> usize {
        self.bytes_have_send
    }

    /// Bytes of the staged response still to go.
    pub fn pending_bytes(&self) -> usize {
        self.bytes_to_send
    }
}

/// `fmt::Write` over the fixed header buffer; overflow is an error.
struct HeaderWriter<'a>(&'a mut ArrayVec<u8, WRITE_BUFFER_SIZE>);

impl fmt::Write for HeaderWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.try_extend_from_slice(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use crate::http::CheckState;
    use crate::users::UserCache;
    use std::fs;
    use std::io::{Read, Write};
    use std::net::Ipv4Addr;
    use std::os::fd::FromRawFd;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread;

    struct Fixture {
        _dir: tempfile::TempDir,
        router: Router,
        db: MemoryDatabase,
        conn: Box<HttpConn>,
        peer: UnixStream,
    }

    fn fixture(edge: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let judge = dir.path().join("judge.html");
        fs::write(&judge, "<p>judge</p>").unwrap();
        fs::set_permissions(&judge, fs::Permissions::from_mode(0o644)).unwrap();
        let router = Router::new(dir.path(), Arc::new(UserCache::new()));

        let (ours, theirs) = syscalls::socketpair().unwrap();
        let mut conn = Box::new(HttpConn::new());
        conn.init(ours, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4242), edge);
        let mut peer = unsafe { UnixStream::from_raw_fd(theirs) };
        peer.set_nonblocking(false).unwrap();
        peer.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
        Fixture {
            _dir: dir,
            router,
            db: MemoryDatabase::new(),
            conn,
            peer,
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            syscalls::close(self.conn.fd());
        }
    }

    fn read_response(peer: &mut UnixStream, len: usize) -> String {
        let mut buf = vec![0u8; len];
        peer.read_exact(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn serves_file_and_resets_for_keep_alive() {
        let mut f = fixture(false);
        f.peer
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(f.conn.read_once());
        assert_eq!(f.conn.process(&f.router, &mut f.db), Next::Write);
        let header = String::from_utf8(f.conn.header().to_vec()).unwrap();
        assert!(header.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(header.contains("Content-Length: 12\r\n"));
        assert!(header.contains("Connection: keep-alive\r\n"));

        let total = f.conn.header().len() + 12;
        assert_eq!(f.conn.write(), Flush::Done { keep_alive: true });
        let response = read_response(&mut f.peer, total);
        assert!(response.ends_with("\r\n\r\n<p>judge</p>"));

        // ready for the next request on the same socket
        assert_eq!(f.conn.read_len(), 0);
        assert_eq!(f.conn.parser().state(), CheckState::RequestLine);
        assert!(f.conn.header().is_empty());
    }

    #[test]
    fn missing_file_is_404_and_closes() {
        let mut f = fixture(false);
        f.conn.receive(b"GET /nope HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(f.conn.process(&f.router, &mut f.db), Next::Write);
        let header = String::from_utf8(f.conn.header().to_vec()).unwrap();
        assert!(header.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(header.contains("Connection: close\r\n"));
        assert!(header.ends_with("The requested file was not found on this server.\n"));
        assert_eq!(f.conn.write(), Flush::Done { keep_alive: false });
    }

    #[test]
    fn large_file_resumes_after_would_block() {
        let mut f = fixture(false);
        let body: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let big = f.router.doc_root().join("big.html");
        fs::write(&big, &body).unwrap();
        fs::set_permissions(&big, fs::Permissions::from_mode(0o644)).unwrap();

        f.conn.receive(b"GET /big.html HTTP/1.1\r\n\r\n");
        assert_eq!(f.conn.process(&f.router, &mut f.db), Next::Write);
        let header_len = f.conn.header().len();
        let total = header_len + body.len();

        // the socket buffer is far smaller than the file
        assert_eq!(f.conn.write(), Flush::Pending);
        assert!(f.conn.bytes_sent() > header_len);
        assert!(f.conn.bytes_sent() < total);

        let mut peer = f.peer.try_clone().unwrap();
        let reader = thread::spawn(move || {
            let mut buf = vec![0u8; total];
            peer.read_exact(&mut buf).unwrap();
            buf
        });
        loop {
            match f.conn.write() {
                Flush::Pending => thread::yield_now(),
                Flush::Done { keep_alive } => {
                    assert!(!keep_alive);
                    break;
                }
                Flush::Failed => panic!("write failed after {} bytes", f.conn.bytes_sent()),
            }
        }
        assert_eq!(f.conn.pending_bytes(), 0);

        let got = reader.join().unwrap();
        assert!(got.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(got[..header_len].ends_with(b"\r\n\r\n"));
        assert!(got[header_len..] == body[..], "body differs from the file");
    }

    #[test]
    fn old_version_is_rejected() {
        let mut f = fixture(false);
        f.conn.receive(b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(f.conn.process(&f.router, &mut f.db), Next::Write);
        assert!(f.conn.header().starts_with(b"HTTP/1.1 404"));
    }

    #[test]
    fn huge_content_length_gets_error_page() {
        let mut f = fixture(false);
        f.conn
            .receive(b"POST /3 HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\nx");
        assert_eq!(f.conn.process(&f.router, &mut f.db), Next::Write);
        assert!(f.conn.header().starts_with(b"HTTP/1.1 404"));
        assert_eq!(f.conn.write(), Flush::Done { keep_alive: false });
    }

    #[test]
    fn partial_request_waits_for_more() {
        let mut f = fixture(true);
        f.peer.write_all(b"GET / HT").unwrap();
        assert!(f.conn.read_once());
        assert_eq!(f.conn.process(&f.router, &mut f.db), Next::Read);
        f.peer.write_all(b"TP/1.1\r\n\r\n").unwrap();
        assert!(f.conn.read_once());
        assert_eq!(f.conn.process(&f.router, &mut f.db), Next::Write);
    }

    #[test]
    fn peer_close_fails_read() {
        let mut f = fixture(true);
        f.peer.shutdown(std::net::Shutdown::Write).unwrap();
        assert!(!f.conn.read_once());
    }

    #[test]
    fn full_buffer_fails_read() {
        let mut f = fixture(false);
        let junk = [b'a'; READ_BUFFER_SIZE];
        assert_eq!(f.conn.receive(&junk), READ_BUFFER_SIZE);
        assert_eq!(f.conn.receive(b"more"), 0);
        assert!(!f.conn.read_once());
    }

    #[test]
    fn empty_file_gets_placeholder_body() {
        let mut f = fixture(false);
        let empty = f.router.doc_root().join("empty.html");
        fs::write(&empty, "").unwrap();
        fs::set_permissions(&empty, fs::Permissions::from_mode(0o644)).unwrap();
        f.conn.receive(b"GET /empty.html HTTP/1.1\r\n\r\n");
        assert_eq!(f.conn.process(&f.router, &mut f.db), Next::Write);
        let header = String::from_utf8(f.conn.header().to_vec()).unwrap();
        assert!(header.contains("Content-Length: 26\r\n"));
        assert!(header.ends_with(EMPTY_PAGE));
    }
}
