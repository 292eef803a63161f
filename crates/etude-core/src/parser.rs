// src/parser.rs
//! Incremental HTTP/1.1 request parser.
//!
//! Works over a connection's read buffer in place: line terminators are
//! overwritten with NUL bytes as they are consumed, and only cursor offsets
//! are kept between calls, so the parser never allocates and never cares
//! where the socket happened to split the stream.

use std::ops::Range;

use arrayvec::ArrayString;
use memchr::memchr2;
use tracing::debug;

use crate::http::{
    CheckState, FILENAME_LEN, HttpCode, LineStatus, Method, READ_BUFFER_SIZE, SUPPORTED_VERSION,
    pages,
};

/// Scan `buf` from `cursor` for the end of one line.
///
/// On `Ok` the two terminator bytes are zeroed and the returned cursor sits
/// just past them. A trailing `\r` with nothing after it is `Open` and the
/// cursor stays on the `\r` so the next scan re-examines it.
pub fn scan_line(buf: &mut [u8], cursor: usize) -> (LineStatus, usize) {
    let len = buf.len();
    if cursor >= len {
        return (LineStatus::Open, cursor);
    }
    let Some(offset) = memchr2(b'\r', b'\n', &buf[cursor..]) else {
        return (LineStatus::Open, len);
    };
    let at = cursor + offset;
    if buf[at] == b'\r' {
        if at + 1 == len {
            return (LineStatus::Open, at);
        }
        if buf[at + 1] == b'\n' {
            buf[at] = 0;
            buf[at + 1] = 0;
            return (LineStatus::Ok, at + 2);
        }
        return (LineStatus::Bad, at);
    }
    // bare '\n'
    if at > 1 && buf[at - 1] == b'\r' {
        buf[at - 1] = 0;
        buf[at] = 0;
        return (LineStatus::Ok, at + 1);
    }
    (LineStatus::Bad, at)
}

/// Fields of the request currently being parsed.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: Method,
    /// Normalized target, always starting with `/`.
    pub url: ArrayString<FILENAME_LEN>,
    /// Offsets of the `Host` value in the read buffer.
    pub host: Option<Range<usize>>,
    pub content_length: usize,
    /// `Connection: keep-alive` was seen.
    pub keep_alive: bool,
    /// POST: the body carries form fields.
    pub has_body: bool,
    /// Offsets of the body in the read buffer once complete.
    pub body: Range<usize>,
}

#[derive(Debug, Default)]
pub struct RequestParser {
    state: CheckState,
    checked: usize,
    line_start: usize,
    request: Request,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Bytes scanned so far.
    pub fn checked(&self) -> usize {
        self.checked
    }

    /// Drive the request machine over everything received so far.
    ///
    /// `buf` is the filled part of the read buffer. Returns `NoRequest` when
    /// more bytes are needed, `GetRequest` once a full request is parsed, or
    /// `BadRequest`.
    pub fn advance(&mut self, buf: &mut [u8]) -> HttpCode {
        loop {
            if self.state == CheckState::Body {
                return self.parse_content(buf.len());
            }

            let (status, next) = scan_line(buf, self.checked);
            self.checked = next;
            match status {
                LineStatus::Open => return HttpCode::NoRequest,
                LineStatus::Bad => return HttpCode::BadRequest,
                LineStatus::Ok => {}
            }

            let line = self.line_start..next - 2;
            self.line_start = next;

            let code = match self.state {
                CheckState::RequestLine => self.parse_request_line(&buf[line]),
                CheckState::Headers => self.parse_header(buf, line),
                CheckState::Body => unreachable!(),
            };
            if code != HttpCode::NoRequest {
                return code;
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> HttpCode {
        let (method, rest) = split_token(line);
        let Some(method) = Method::from_bytes(method) else {
            return HttpCode::BadRequest;
        };
        if rest.is_empty() {
            return HttpCode::BadRequest;
        }
        let (target, rest) = split_token(trim_start(rest));
        if rest.is_empty() {
            return HttpCode::BadRequest;
        }
        let version = trim_start(rest);
        if !version.eq_ignore_ascii_case(SUPPORTED_VERSION) {
            return HttpCode::BadRequest;
        }

        let Some(url) = normalize_target(target) else {
            return HttpCode::BadRequest;
        };

        self.request.method = method;
        self.request.has_body = method == Method::Post;
        self.request.url = url;
        self.state = CheckState::Headers;
        HttpCode::NoRequest
    }

    fn parse_header(&mut self, buf: &[u8], line: Range<usize>) -> HttpCode {
        let text = &buf[line.clone()];
        if text.is_empty() {
            if self.request.content_length != 0 {
                self.state = CheckState::Body;
                return HttpCode::NoRequest;
            }
            self.request.body = line.start..line.start;
            return HttpCode::GetRequest;
        }

        if let Some(value) = strip_header(text, b"Connection:") {
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.request.keep_alive = true;
            }
        } else if let Some(value) = strip_header(text, b"Content-length:") {
            match parse_length(value) {
                Some(n) => self.request.content_length = n,
                None => return HttpCode::BadRequest,
            }
        } else if let Some(value) = strip_header(text, b"Host:") {
            let start = line.end - value.len();
            self.request.host = Some(start..line.end);
        } else {
            debug!("unknown header: {}", String::from_utf8_lossy(text));
        }
        HttpCode::NoRequest
    }

    fn parse_content(&mut self, read_len: usize) -> HttpCode {
        // body begins right after the blank line
        let start = self.checked;
        // a body that can never fit the read buffer is rejected outright
        let end = match start.checked_add(self.request.content_length) {
            Some(end) if end <= READ_BUFFER_SIZE => end,
            _ => return HttpCode::BadRequest,
        };
        if read_len >= end {
            self.request.body = start..end;
            return HttpCode::GetRequest;
        }
        HttpCode::NoRequest
    }
}

fn is_blank(b: &u8) -> bool {
    *b == b' ' || *b == b'\t'
}

/// Split at the first space/tab. The delimiter is dropped.
fn split_token(s: &[u8]) -> (&[u8], &[u8]) {
    match s.iter().position(is_blank) {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => (s, &s[s.len()..]),
    }
}

fn trim_start(s: &[u8]) -> &[u8] {
    let skip = s.iter().take_while(|b| is_blank(b)).count();
    &s[skip..]
}

fn strip_header<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if line.len() >= name.len() && line[..name.len()].eq_ignore_ascii_case(name) {
        Some(trim_start(&line[name.len()..]))
    } else {
        None
    }
}

/// Leading decimal digits; a value without digits counts as zero.
fn parse_length(value: &[u8]) -> Option<usize> {
    value
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .try_fold(0usize, |acc, d| acc.checked_mul(10)?.checked_add((d - b'0') as usize))
}

/// Strip an absolute-form scheme and host, reject anything that is not an
/// origin path, and map `/` to the judge page.
fn normalize_target(target: &[u8]) -> Option<ArrayString<FILENAME_LEN>> {
    let mut path = target;
    for scheme in [&b"http://"[..], &b"https://"[..]] {
        if path.len() >= scheme.len() && path[..scheme.len()].eq_ignore_ascii_case(scheme) {
            let rest = &path[scheme.len()..];
            path = &rest[rest.iter().position(|&b| b == b'/')?..];
        }
    }
    if path.first() != Some(&b'/') {
        return None;
    }
    let path = std::str::from_utf8(path).ok()?;
    if path.split('/').any(|seg| seg == "..") {
        return None;
    }
    if path == "/" {
        return ArrayString::from(pages::JUDGE).ok();
    }
    ArrayString::from(path).ok()
}
