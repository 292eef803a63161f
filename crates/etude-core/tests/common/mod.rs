// tests/common/mod.rs
#![allow(dead_code)]

use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use etude_core::{
    ConnectionPool, Database, DispatchMode, EtudeResult, MemoryDatabase, Server, ServerConfig,
    ServerMetrics, ShutdownHandle, TriggerMode,
};
use tempfile::TempDir;

pub const PAGES: &[(&str, &str)] = &[
    ("judge.html", "<html><body>judge</body></html>"),
    ("register.html", "<html><body>register</body></html>"),
    ("log.html", "<html><body>login</body></html>"),
    ("welcome.html", "<html><body>welcome</body></html>"),
    ("logError.html", "<html><body>login failed</body></html>"),
    ("registerError.html", "<html><body>register failed</body></html>"),
    ("picture.html", "<html><body>picture</body></html>"),
    ("video.html", "<html><body>video</body></html>"),
    ("fans.html", "<html><body>fans</body></html>"),
    ("empty.html", ""),
];

/// Served alongside the pages; several socket buffers long.
pub const LARGE_FILE: &str = "large.html";
const LARGE_FILE_LEN: usize = 6 * 1024 * 1024;

pub fn large_body() -> Vec<u8> {
    (0..LARGE_FILE_LEN).map(|i| (i % 251) as u8).collect()
}

pub struct Running {
    pub addr: SocketAddr,
    pub handle: ShutdownHandle,
    pub metrics: Arc<ServerMetrics>,
    pub thread: Option<JoinHandle<EtudeResult<()>>>,
    _root: TempDir,
}

fn write_page(dir: &Path, name: &str, body: &str, mode: u32) {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
}

/// Serve a temporary document root on an ephemeral port.
pub fn start(dispatch: DispatchMode, trigger_mode: TriggerMode) -> Running {
    start_with(dispatch, trigger_mode, |_| {})
}

pub fn start_with(
    dispatch: DispatchMode,
    trigger_mode: TriggerMode,
    tweak: impl FnOnce(&mut ServerConfig),
) -> Running {
    let db = MemoryDatabase::with_users([("alice", "wonder")]);
    let handles = (0..2).map(|_| Box::new(db.clone()) as Box<dyn Database>).collect();
    start_with_db(dispatch, trigger_mode, handles, tweak)
}

/// Like [`start_with`], over caller-supplied database handles.
pub fn start_with_db(
    dispatch: DispatchMode,
    trigger_mode: TriggerMode,
    handles: Vec<Box<dyn Database>>,
    tweak: impl FnOnce(&mut ServerConfig),
) -> Running {
    let root = tempfile::tempdir().unwrap();
    fs::set_permissions(root.path(), fs::Permissions::from_mode(0o755)).unwrap();
    for (name, body) in PAGES {
        write_page(root.path(), name, body, 0o644);
    }
    write_page(root.path(), "private.html", "secret", 0o600);
    let large = root.path().join(LARGE_FILE);
    fs::write(&large, large_body()).unwrap();
    fs::set_permissions(&large, fs::Permissions::from_mode(0o644)).unwrap();
    fs::create_dir(root.path().join("subdir")).unwrap();

    let mut config = ServerConfig {
        port: 0,
        doc_root: root.path().to_path_buf(),
        trigger_mode,
        dispatch,
        worker_threads: 4,
        timeslot: Duration::from_secs(1),
        ..ServerConfig::default()
    };
    tweak(&mut config);
    let pool = ConnectionPool::new(handles);

    let (tx, rx) = mpsc::channel();
    let thread = thread::Builder::new()
        .name("etude-test-server".to_string())
        .spawn(move || {
            let mut server = Server::new(config, pool)?;
            let _ = tx.send((server.local_addr(), server.shutdown_handle(), server.metrics()));
            server.run()
        })
        .unwrap();
    let (addr, handle, metrics) = rx.recv().expect("server failed to start");

    Running {
        addr,
        handle,
        metrics,
        thread: Some(thread),
        _root: root,
    }
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = loop {
        match TcpStream::connect(addr) {
            Ok(s) => break s,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("connect {}: {}", addr, e),
        }
    };
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }

    pub fn keep_alive(&self) -> bool {
        self.head.contains("Connection: keep-alive")
    }
}

/// Read exactly one response: headers, then `Content-Length` bytes.
pub fn read_response(stream: &mut TcpStream) -> Response {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(0) => panic!("connection closed mid-headers: {:?}", String::from_utf8_lossy(&head)),
            Ok(_) => head.push(byte[0]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("read headers: {}", e),
        }
    }
    let head = String::from_utf8(head).unwrap();
    let status = head
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .and_then(|v| v.trim().parse().ok())
        .expect("content length");
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    Response { status, head, body }
}

pub fn roundtrip(addr: SocketAddr, request: &[u8]) -> Response {
    let mut stream = connect(addr);
    stream.write_all(request).unwrap();
    read_response(&mut stream)
}

pub fn get(addr: SocketAddr, target: &str) -> Response {
    roundtrip(
        addr,
        format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", target).as_bytes(),
    )
}

pub fn post_form(addr: SocketAddr, target: &str, user: &str, password: &str) -> Response {
    let body = format!("user={}&password={}", user, password);
    roundtrip(
        addr,
        format!(
            "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{}",
            target,
            body.len(),
            body
        )
        .as_bytes(),
    )
}

/// Poll `check` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    check()
}

/// True once the server closes its end.
pub fn wait_for_eof(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return true,
            Err(_) => return false,
        }
    }
}

// ---- Scenarios shared by every dispatch mode ----

pub fn serves_judge_page_for_root(addr: SocketAddr) {
    let res = get(addr, "/");
    assert_eq!(res.status, 200, "{}", res.head);
    assert_eq!(res.body_str(), "<html><body>judge</body></html>");
    assert!(res.head.contains("Connection: close"));
}

pub fn keep_alive_serves_several_requests(addr: SocketAddr) {
    let mut stream = connect(addr);
    for page in ["/picture.html", "/video.html", "/fans.html"] {
        stream
            .write_all(
                format!("GET {} HTTP/1.1\r\nConnection: keep-alive\r\n\r\n", page).as_bytes(),
            )
            .unwrap();
        let res = read_response(&mut stream);
        assert_eq!(res.status, 200);
        assert!(res.keep_alive(), "{}", res.head);
        assert!(res.body_str().contains(page.trim_start_matches('/').trim_end_matches(".html")));
    }
}

pub fn error_statuses_close_the_connection(addr: SocketAddr) {
    let cases = [
        ("/missing.html", 404, "Not Found"),
        ("/private.html", 403, "Forbidden"),
        ("/subdir", 404, "Not Found"),
    ];
    for (target, status, title) in cases {
        let mut stream = connect(addr);
        stream
            .write_all(
                format!("GET {} HTTP/1.1\r\nConnection: keep-alive\r\n\r\n", target).as_bytes(),
            )
            .unwrap();
        let res = read_response(&mut stream);
        assert_eq!(res.status, status, "{}", target);
        assert!(res.head.starts_with(&format!("HTTP/1.1 {} {}", status, title)));
        assert!(res.head.contains("Connection: close"));
        assert!(wait_for_eof(&mut stream), "{} left the connection open", target);
    }
}

pub fn malformed_requests_get_not_found(addr: SocketAddr) {
    let res = roundtrip(addr, b"GET / HTTP/1.0\r\n\r\n");
    assert_eq!(res.status, 404);
    let res = roundtrip(addr, b"PUT / HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 404);
    let res = roundtrip(addr, b"GET /../etc/passwd HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 404);
}

pub fn empty_file_gets_placeholder_body(addr: SocketAddr) {
    let res = get(addr, "/empty.html");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "<html><body></body></html>");
}

pub fn absolute_form_target_is_accepted(addr: SocketAddr) {
    let res = get(addr, "http://localhost/video.html");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "<html><body>video</body></html>");
}

pub fn route_digits_pick_fixed_pages(addr: SocketAddr) {
    let cases = [
        ("/0", "register"),
        ("/1", "login"),
        ("/5", "picture"),
        ("/6", "video"),
        ("/7", "fans"),
    ];
    for (target, word) in cases {
        let res = get(addr, target);
        assert_eq!(res.status, 200, "{}", target);
        assert_eq!(res.body_str(), format!("<html><body>{}</body></html>", word));
    }
}

/// `user` must be unique per server.
pub fn register_then_login(addr: SocketAddr, user: &str) {
    let res = post_form(addr, "/3CGISQL.cgi", user, "pw1");
    assert_eq!(res.body_str(), "<html><body>login</body></html>");

    let res = post_form(addr, "/3CGISQL.cgi", user, "other");
    assert_eq!(res.body_str(), "<html><body>register failed</body></html>");

    let res = post_form(addr, "/2CGISQL.cgi", user, "pw1");
    assert_eq!(res.body_str(), "<html><body>welcome</body></html>");

    let res = post_form(addr, "/2CGISQL.cgi", user, "wrong");
    assert_eq!(res.body_str(), "<html><body>login failed</body></html>");

    // preloaded from the database at startup
    let res = post_form(addr, "/2CGISQL.cgi", "alice", "wonder");
    assert_eq!(res.body_str(), "<html><body>welcome</body></html>");
}

pub fn request_split_across_writes(addr: SocketAddr) {
    let mut stream = connect(addr);
    stream.write_all(b"GET /fans.html HT").unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"TP/1.1\r\nHost: x\r\n").unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"\r\n").unwrap();
    let res = read_response(&mut stream);
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "<html><body>fans</body></html>");
}

pub fn concurrent_clients(addr: SocketAddr) {
    let clients: Vec<_> = (0..16)
        .map(|_| {
            thread::spawn(move || {
                for _ in 0..5 {
                    let res = get(addr, "/picture.html");
                    assert_eq!(res.status, 200);
                }
            })
        })
        .collect();
    for c in clients {
        c.join().unwrap();
    }
}

/// Timeslot is one second, so an idle socket is dropped within a few.
pub fn idle_connection_is_evicted(running: &Running) {
    let before = running.metrics.snapshot().evicted;
    let mut stream = connect(running.addr);
    stream.write_all(b"GET /judge.html HT").unwrap();
    assert!(wait_for_eof(&mut stream), "idle connection was not closed");
    assert!(
        wait_until(Duration::from_secs(2), || running.metrics.snapshot().evicted > before),
        "eviction was not counted"
    );
}

pub fn large_file_arrives_intact(addr: SocketAddr) {
    let res = get(addr, &format!("/{}", LARGE_FILE));
    assert_eq!(res.status, 200);
    assert_eq!(res.body.len(), LARGE_FILE_LEN);
    assert!(res.body == large_body(), "large body differs from the file");
}
