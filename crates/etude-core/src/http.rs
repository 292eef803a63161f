// src/http.rs
//! Protocol vocabulary shared by the parser, the resolver and the response
//! writer.

/// Read buffer capacity per connection.
pub const READ_BUFFER_SIZE: usize = 2048;
/// Header buffer capacity per connection.
pub const WRITE_BUFFER_SIZE: usize = 1024;
/// Longest request target (and resolved path suffix) accepted.
pub const FILENAME_LEN: usize = 200;

pub const SUPPORTED_VERSION: &[u8] = b"HTTP/1.1";

/// Served for zero-length files.
pub const EMPTY_PAGE: &str = "<html><body></body></html>";

/// Written to a connection turned away at accept time.
pub const BUSY_MESSAGE: &[u8] = b"Internal server busy";

/// Fixed page names under the document root.
pub mod pages {
    pub const JUDGE: &str = "/judge.html";
    pub const REGISTER: &str = "/register.html";
    pub const LOGIN: &str = "/log.html";
    pub const WELCOME: &str = "/welcome.html";
    pub const LOGIN_ERROR: &str = "/logError.html";
    pub const REGISTER_ERROR: &str = "/registerError.html";
    pub const PICTURE: &str = "/picture.html";
    pub const VIDEO: &str = "/video.html";
    pub const FANS: &str = "/fans.html";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

impl Method {
    /// Case-insensitive; anything but GET/POST is unsupported.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.eq_ignore_ascii_case(b"GET") {
            Some(Method::Get)
        } else if b.eq_ignore_ascii_case(b"POST") {
            Some(Method::Post)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// Request machine position. Only ever moves forward within one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    RequestLine,
    Headers,
    Body,
}

/// Line scanner verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Ok,
    Bad,
    Open,
}

/// Outcome of driving a connection's request machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Need more bytes.
    NoRequest,
    /// Request complete, not yet resolved.
    GetRequest,
    BadRequest,
    NoResource,
    Forbidden,
    FileRequest,
    InternalError,
}

impl HttpCode {
    /// Status line and literal body for the error outcomes.
    ///
    /// Malformed requests answer 404, not 400: clients already depend on it.
    pub fn error_response(self) -> Option<(u16, &'static str, &'static str)> {
        match self {
            HttpCode::InternalError => Some((500, "Internal Error", ERROR_500_FORM)),
            HttpCode::BadRequest | HttpCode::NoResource => {
                Some((404, "Not Found", ERROR_404_FORM))
            }
            HttpCode::Forbidden => Some((403, "Forbidden", ERROR_403_FORM)),
            _ => None,
        }
    }
}

pub const OK_TITLE: &str = "OK";
const ERROR_403_FORM: &str = "You do not have permission to get file from this server.\n";
const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
const ERROR_500_FORM: &str = "There was an unusual problem serving the requested file.\n";
