//! Minimal HTTP/1.1 request parser and response encoder.
//!
//! Request head grammar:
//!
//! ```text
//! METHOD SP /TARGET SP HTTP/d.d CRLF
//! *( NAME ": " VALUE CRLF )
//! CRLF
//! ```
//!
//! Only `GET` and `PUT` are served; any other well-formed method parses into
//! [`Method::Other`] so the dispatcher can answer 501.

use std::io::{self, Read, Write};

use bytes::{Bytes, BytesMut};
use tracing::debug;

/// Default upper bound on the request head, terminator included.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 2048;

const MAX_METHOD_LEN: usize = 8;
const MAX_TARGET_LEN: usize = 256;
const MAX_HEADER_NAME_LEN: usize = 128;
const MAX_HEADER_VALUE_LEN: usize = 128;
const READ_CHUNK: usize = 2048;
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
const SUPPORTED_VERSION: &str = "HTTP/1.1";

/// Header carrying the client's correlation token.
pub const REQUEST_ID_HEADER: &str = "Request-Id";
/// Correlation token recorded when the client sends none.
pub const DEFAULT_REQUEST_ID: &str = "0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Other(String),
}

impl Method {
    fn from_token(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "PUT" => Method::Put,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Other(name) => name.as_str(),
        }
    }
}

/// Every status this server can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Created,
    BadRequest,
    Forbidden,
    NotFound,
    InternalServerError,
    NotImplemented,
    VersionNotSupported,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::VersionNotSupported => 505,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Created => "Created",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::VersionNotSupported => "Version Not Supported",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: String,
    headers: Vec<(String, String)>,
    content_length: Option<u64>,
    body_prefix: Bytes,
}

impl Request {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The raw request target, leading slash included.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The target relative to the serve root.
    pub fn resource_name(&self) -> &str {
        &self.target[1..]
    }

    /// Case-insensitive header lookup; the first occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn request_id(&self) -> &str {
        self.header(REQUEST_ID_HEADER).unwrap_or(DEFAULT_REQUEST_ID)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Body bytes that arrived in the same reads as the head.
    pub fn body_prefix(&self) -> &[u8] {
        &self.body_prefix
    }
}

/// Read and parse one request head from `reader`.
///
/// On failure the returned status is the response the peer should get.
pub fn parse<R: Read>(reader: &mut R, max_head_bytes: usize) -> Result<Request, StatusCode> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    let head_end = loop {
        if let Some(pos) = find_terminator(&buf) {
            break pos;
        }
        if buf.len() >= max_head_bytes {
            debug!("Request head exceeds {} bytes", max_head_bytes);
            return Err(StatusCode::BadRequest);
        }

        match reader.read(&mut chunk) {
            Ok(0) => {
                debug!("Peer closed before completing the request head");
                return Err(StatusCode::BadRequest);
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("Reading request head failed: {}", e);
                return Err(StatusCode::BadRequest);
            }
        }
    };

    if head_end + HEAD_TERMINATOR.len() > max_head_bytes {
        return Err(StatusCode::BadRequest);
    }

    let head = buf.split_to(head_end + HEAD_TERMINATOR.len());
    let body_prefix = buf.freeze();
    let head = std::str::from_utf8(&head[..head_end]).map_err(|_| StatusCode::BadRequest)?;

    parse_head(head, body_prefix)
}

fn parse_head(head: &str, body_prefix: Bytes) -> Result<Request, StatusCode> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or(StatusCode::BadRequest)?;

    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(StatusCode::BadRequest);
    };

    if !valid_method(method) || !valid_target(target) || !valid_version(version) {
        return Err(StatusCode::BadRequest);
    }
    if version != SUPPORTED_VERSION {
        return Err(StatusCode::VersionNotSupported);
    }

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line.split_once(": ").ok_or(StatusCode::BadRequest)?;
        if !valid_header_name(name) || !valid_header_value(value) {
            return Err(StatusCode::BadRequest);
        }
        headers.push((name.to_string(), value.to_string()));
    }

    let mut request = Request {
        method: Method::from_token(method),
        target: target.to_string(),
        headers,
        content_length: None,
        body_prefix,
    };

    request.content_length = match request.header("Content-Length") {
        Some(value) => Some(value.parse::<u64>().map_err(|_| StatusCode::BadRequest)?),
        None => None,
    };

    if request.method == Method::Put && request.content_length.is_none() {
        return Err(StatusCode::BadRequest);
    }

    Ok(request)
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

fn valid_method(method: &str) -> bool {
    (1..=MAX_METHOD_LEN).contains(&method.len()) && method.bytes().all(|b| b.is_ascii_alphabetic())
}

fn valid_target(target: &str) -> bool {
    let Some(name) = target.strip_prefix('/') else {
        return false;
    };
    if name.is_empty() || target.len() > MAX_TARGET_LEN {
        return false;
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b'/'))
    {
        return false;
    }
    name.split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

fn valid_version(version: &str) -> bool {
    let bytes = version.as_bytes();
    bytes.len() == 8
        && bytes.starts_with(b"HTTP/")
        && bytes[5].is_ascii_digit()
        && bytes[6] == b'.'
        && bytes[7].is_ascii_digit()
}

fn valid_header_name(name: &str) -> bool {
    (1..=MAX_HEADER_NAME_LEN).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-'))
}

fn valid_header_value(value: &str) -> bool {
    (1..=MAX_HEADER_VALUE_LEN).contains(&value.len())
        && value.bytes().all(|b| (b' '..=b'~').contains(&b))
}

/// Write the complete response for `status`, body included.
///
/// Not used for a successful read; see [`write_ok_head`].
pub fn send_response<W: Write>(writer: &mut W, status: StatusCode) -> io::Result<()> {
    let body = format!("{}\n", status.reason());
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n\r\n{}",
        status.code(),
        status.reason(),
        body.len(),
        body
    );
    writer.write_all(response.as_bytes())?;
    writer.flush()
}

/// Write the head of a 200 response whose body is `content_length` bytes
/// supplied by the caller.
pub fn write_ok_head<W: Write>(writer: &mut W, content_length: u64) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n\r\n",
        StatusCode::Ok.code(),
        StatusCode::Ok.reason(),
        content_length
    );
    writer.write_all(head.as_bytes())
}
