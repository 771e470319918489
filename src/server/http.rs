//! Minimal HTTP/1.1 framing over a blocking stream.
//!
//! One request per connection: the request head is parsed, any declared
//! body is drained, and every response carries `Connection: close`.

use std::io::{self, Read, Write};
use std::time::SystemTime;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024;

/// `Last-Modified` is pinned so that players never revalidate.
pub const LAST_MODIFIED: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Method as sent, e.g. `GET`.
    pub method: String,
    /// Raw request target, query string included.
    pub target: String,
    /// Header names are lowercased.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| key == &name)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_method(&self, method: &str) -> bool {
        self.method.eq_ignore_ascii_case(method)
    }

    /// Path component of the request target, without any query string.
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Read and parse one request from `stream`.
pub fn read_request<R: Read>(stream: &mut R) -> io::Result<Request> {
    let mut buffer = Vec::with_capacity(1024);
    let header_end = loop {
        let mut chunk = [0u8; 1024];
        let n = match stream.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_HEADER_BYTES {
            return Err(invalid("request head too large"));
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]);
    let mut lines = head.lines();
    let request_line = lines.next().ok_or_else(|| invalid("missing request line"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| invalid("missing method"))?.to_string();
    let target = parts.next().ok_or_else(|| invalid("missing request target"))?.to_string();
    if !target.starts_with('/') {
        return Err(invalid("request target must be an absolute path"));
    }

    let mut content_length = 0usize;
    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            if name == "content-length" {
                content_length = value.parse().map_err(|_| invalid("invalid content length"))?;
            }
            headers.push((name, value));
        }
    }
    if content_length > MAX_BODY_BYTES {
        return Err(invalid("request body too large"));
    }

    let mut body = buffer[header_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0u8; 1024];
        let n = match stream.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "request body truncated",
            ));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Request {
        method,
        target,
        headers,
        body,
    })
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Status line plus headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    /// Written in insertion order, after the status line.
    pub headers: Vec<(&'static str, String)>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Headers every media response carries.
    pub fn media(status: u16, content_type: &str, content_length: u64) -> Self {
        Self::new(status)
            .header("Content-Type", content_type)
            .header("Content-Length", content_length.to_string())
            .header("Accept-Ranges", "bytes")
            .header("Date", httpdate::fmt_http_date(SystemTime::now()))
            .header("Last-Modified", LAST_MODIFIED)
    }

    /// Empty-bodied response for an error status.
    pub fn empty(status: u16) -> Self {
        Self::new(status)
            .header("Content-Length", "0")
            .header("Date", httpdate::fmt_http_date(SystemTime::now()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Serialize the head, always ending with `Connection: close`.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status));
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("Connection: close\r\n\r\n");
        out.write_all(head.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_get_with_range() {
        let raw = b"GET /v=abc;k=pw HTTP/1.1\r\nHost: localhost\r\nRange: bytes=0-9\r\n\r\n";
        let request = read_request(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "/v=abc;k=pw");
        assert_eq!(request.header("RANGE"), Some("bytes=0-9"));
        assert_eq!(request.header("host"), Some("localhost"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn test_parse_post_body() {
        let raw = b"POST /control/playpause HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let request = read_request(&mut Cursor::new(&raw[..])).unwrap();
        assert!(request.is_method("post"));
        assert_eq!(request.body, b"hello");
    }

    #[test]
    fn test_path_strips_query() {
        let raw = b"GET /control?x=1 HTTP/1.1\r\n\r\n";
        let request = read_request(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(request.path(), "/control");
    }

    #[test]
    fn test_rejects_incomplete_head() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n";
        let err = read_request(&mut Cursor::new(&raw[..])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_rejects_relative_target() {
        let raw = b"GET v=abc HTTP/1.1\r\n\r\n";
        let err = read_request(&mut Cursor::new(&raw[..])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_rejects_oversized_head() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEADER_BYTES + 10));
        let err = read_request(&mut Cursor::new(raw)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_write_media_head() {
        let head = ResponseHead::media(206, "video/mpeg", 100)
            .header("Content-Range", "bytes 100-199/1000");
        let mut out = Vec::new();
        head.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(text.contains("Content-Type: video/mpeg\r\n"));
        assert!(text.contains("Content-Length: 100\r\n"));
        assert!(text.contains("Accept-Ranges: bytes\r\n"));
        assert!(text.contains("Last-Modified: Thu, 01 Jan 1970 00:00:00 GMT\r\n"));
        assert!(text.contains("Content-Range: bytes 100-199/1000\r\n"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
        assert!(head.get("date").is_some());
    }

    #[test]
    fn test_empty_head() {
        let head = ResponseHead::empty(404);
        assert_eq!(head.get("content-length"), Some("0"));
        let mut out = Vec::new();
        head.write_to(&mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("HTTP/1.1 404 Not Found\r\n"));
    }
}
