use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use thiserror::Error;

use crate::config::BufferPolicy;
use crate::http::request::Method;
use crate::http::response::StatusCode;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request")]
    BadRequest,
    #[error("method not recognized: {0}")]
    UnknownMethod(String),
    #[error("request header exceeds {0} bytes")]
    HeaderTooLarge(usize),
    #[error("request body length required")]
    LengthRequired,
    #[error("request body of {0} bytes is too large")]
    PayloadTooLarge(usize),
    #[error("malformed percent escape")]
    MalformedEscape,
}

impl ParseError {
    /// Status reported to the peer before the connection is closed.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::BadRequest | ParseError::UnknownMethod(_) | ParseError::MalformedEscape => {
                StatusCode::BadRequest
            }
            ParseError::HeaderTooLarge(_) | ParseError::PayloadTooLarge(_) => StatusCode::PayloadTooLarge,
            ParseError::LengthRequired => StatusCode::LengthRequired,
        }
    }
}

/// Request line and headers of one request, plus its framing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    /// Request target exactly as received.
    pub uri: String,
    /// Decoded path, without the query string.
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    /// Header fields keyed by lower-cased name.
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub params: HashMap<String, String>,
    pub content_length: usize,
    pub keep_alive: bool,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    RequestLine,
    Headers,
    Body,
}

/// Incremental HTTP/1.1 request-head parser.
///
/// Bytes can be fed in fragments of any size; complete lines are consumed
/// as soon as they are terminated and the partial tail is kept. Once the
/// blank line is seen the head is returned and any bytes after it stay
/// buffered for [`RequestParser::take_remaining`].
pub struct RequestParser {
    policy: BufferPolicy,
    max_body: usize,
    buf: BytesMut,
    /// Size granted by the growth policy. `BytesMut` may allocate past it;
    /// the cap is enforced on head bytes, not on this figure.
    capacity: usize,
    scanned: usize,
    head_bytes: usize,
    phase: Phase,
    head: Option<RequestHead>,
    pending: Option<String>,
}

impl RequestParser {
    pub fn new(policy: BufferPolicy, max_body: usize) -> Self {
        Self {
            policy,
            max_body,
            buf: BytesMut::with_capacity(policy.initial),
            capacity: policy.initial,
            scanned: 0,
            head_bytes: 0,
            phase: Phase::RequestLine,
            head: None,
            pending: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Line buffer size granted so far by the growth policy.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Consumes `data`, returning the head once it is complete.
    ///
    /// After a head is returned, further bytes are only buffered until
    /// [`RequestParser::reset`].
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<RequestHead>, ParseError> {
        self.buf.extend_from_slice(data);
        if self.phase == Phase::Body {
            return Ok(None);
        }

        while let Some(pos) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + pos;
            let mut line = &self.buf[..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            self.buf.advance(end + 1);
            self.scanned = 0;

            self.head_bytes += end + 1;
            if self.head_bytes > self.policy.max {
                return Err(ParseError::HeaderTooLarge(self.policy.max));
            }

            if let Some(head) = self.on_line(&line)? {
                return Ok(Some(head));
            }
        }
        self.scanned = self.buf.len();

        if self.head_bytes + self.buf.len() > self.policy.max {
            return Err(ParseError::HeaderTooLarge(self.policy.max));
        }
        if self.buf.len() * 10 > self.capacity * 9 {
            if let Some(next) = self.policy.grow(self.capacity) {
                self.buf.reserve(next.saturating_sub(self.buf.len()));
                self.capacity = next;
            }
        }
        Ok(None)
    }

    fn on_line(&mut self, line: &str) -> Result<Option<RequestHead>, ParseError> {
        match self.phase {
            Phase::RequestLine => {
                // Stray blank lines before a request are tolerated.
                if !line.is_empty() {
                    self.head = Some(parse_request_line(line)?);
                    self.phase = Phase::Headers;
                }
                Ok(None)
            }
            Phase::Headers if line.is_empty() => {
                self.commit_pending()?;
                self.phase = Phase::Body;
                let mut head = self.head.take().ok_or(ParseError::BadRequest)?;
                self.frame(&mut head)?;
                Ok(Some(head))
            }
            Phase::Headers => {
                if line.starts_with(' ') || line.starts_with('\t') {
                    match self.pending.as_mut() {
                        Some(pending) => pending.push_str(line),
                        None => return Err(ParseError::BadRequest),
                    }
                } else {
                    self.commit_pending()?;
                    self.pending = Some(line.to_string());
                }
                Ok(None)
            }
            Phase::Body => Ok(None),
        }
    }

    fn commit_pending(&mut self) -> Result<(), ParseError> {
        let Some(field) = self.pending.take() else {
            return Ok(());
        };
        let head = self.head.as_mut().ok_or(ParseError::BadRequest)?;
        let (key, value) = field.split_once(':').ok_or(ParseError::BadRequest)?;
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        if key == "cookie" {
            for pair in value.split(';') {
                if let Some((name, value)) = pair.split_once('=') {
                    let name = name.trim();
                    if !name.is_empty() {
                        head.cookies.insert(name.to_string(), value.to_string());
                    }
                }
            }
        } else {
            head.headers.insert(key, value.to_string());
        }
        Ok(())
    }

    fn frame(&self, head: &mut RequestHead) -> Result<(), ParseError> {
        if head.headers.contains_key("transfer-encoding") {
            return Err(ParseError::LengthRequired);
        }
        head.content_length = match head.headers.get("content-length") {
            Some(value) => value.parse().map_err(|_| ParseError::BadRequest)?,
            None if head.method.requires_body() => return Err(ParseError::LengthRequired),
            None => 0,
        };
        if head.content_length > self.max_body {
            return Err(ParseError::PayloadTooLarge(head.content_length));
        }
        head.keep_alive = head
            .headers
            .get("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"));
        Ok(())
    }

    /// Takes the bytes buffered after the head: body bytes and anything
    /// pipelined behind them.
    pub fn take_remaining(&mut self) -> BytesMut {
        self.scanned = 0;
        self.buf.split()
    }

    /// Prepares for the next request on the same connection.
    pub fn reset(&mut self) {
        self.buf = BytesMut::with_capacity(self.policy.initial);
        self.capacity = self.policy.initial;
        self.scanned = 0;
        self.head_bytes = 0;
        self.phase = Phase::RequestLine;
        self.head = None;
        self.pending = None;
    }
}

fn parse_request_line(line: &str) -> Result<RequestHead, ParseError> {
    let parts: Vec<&str> = line.split(' ').collect();
    let [method, uri, version] = parts.as_slice() else {
        return Err(ParseError::BadRequest);
    };

    let method = Method::from_str(method).ok_or_else(|| ParseError::UnknownMethod(method.to_string()))?;
    if !version.starts_with("HTTP/") || uri.is_empty() {
        return Err(ParseError::BadRequest);
    }

    let (raw_path, query) = match uri.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (*uri, None),
    };
    let path = decode(raw_path)?;
    let params = match &query {
        Some(query) => parse_query(query)?,
        None => HashMap::new(),
    };

    Ok(RequestHead {
        method,
        uri: uri.to_string(),
        path,
        query,
        version: version.to_string(),
        headers: HashMap::new(),
        cookies: HashMap::new(),
        params,
        content_length: 0,
        keep_alive: false,
    })
}

/// Decodes `+` to a space and `%XX` to the byte it names.
///
/// Bytes are processed left to right; anything else is copied through.
/// The result is interpreted as UTF-8, replacing invalid sequences.
pub fn decode(input: &str) -> Result<String, ParseError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hi = bytes.get(i + 1).and_then(|b| hex_value(*b));
                let lo = bytes.get(i + 2).and_then(|b| hex_value(*b));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
                    _ => return Err(ParseError::MalformedEscape),
                }
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Parses `a=1&b=2` pairs. Keys are trimmed, pairs without `=` are skipped.
pub fn parse_query(query: &str) -> Result<HashMap<String, String>, ParseError> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = decode(key)?.trim().to_string();
        if key.is_empty() {
            continue;
        }
        params.insert(key, decode(value)?);
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] = b"GET /test.html?param1=test&param2=this+is+a+test HTTP/1.1\r\n\
Host: localhost\r\n\
X-Folded: first\r\n\
\tsecond\r\n\
Cookie: a=1; session=xyz=\r\n\
Connection: Keep-Alive\r\n\
\r\n";

    fn new_parser() -> RequestParser {
        RequestParser::new(BufferPolicy::default(), 1024)
    }

    fn parse_in_chunks(data: &[u8], size: usize) -> RequestHead {
        let mut parser = new_parser();
        let mut result = None;
        for chunk in data.chunks(size) {
            if let Some(head) = parser.feed(chunk).unwrap() {
                result = Some(head);
            }
        }
        result.expect("request head")
    }

    #[test]
    fn parses_complete_head() {
        let head = parse_in_chunks(REQUEST, REQUEST.len());

        assert_eq!(head.method, Method::GET);
        assert_eq!(head.path, "/test.html");
        assert_eq!(head.params["param1"], "test");
        assert_eq!(head.params["param2"], "this is a test");
        assert_eq!(head.header("Host"), Some("localhost"));
        assert_eq!(head.header("x-folded"), Some("first\tsecond"));
        assert_eq!(head.cookies["a"], "1");
        assert_eq!(head.cookies["session"], "xyz=");
        assert!(!head.headers.contains_key("cookie"));
        assert!(head.keep_alive);
    }

    #[test]
    fn fragmentation_does_not_change_result() {
        let whole = parse_in_chunks(REQUEST, REQUEST.len());
        for size in 1..REQUEST.len() {
            assert_eq!(parse_in_chunks(REQUEST, size), whole, "fragment size {}", size);
        }
    }

    #[test]
    fn request_line_needs_three_tokens() {
        let mut parser = new_parser();
        assert_eq!(parser.feed(b"GET /\r\n"), Err(ParseError::BadRequest));

        let mut parser = new_parser();
        assert_eq!(parser.feed(b"GET  / HTTP/1.1\r\n"), Err(ParseError::BadRequest));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let mut parser = new_parser();
        let err = parser.feed(b"BREW /pot HTTP/1.1\r\n").unwrap_err();
        assert_eq!(err, ParseError::UnknownMethod("BREW".to_string()));
        assert_eq!(err.status(), StatusCode::BadRequest);
    }

    #[test]
    fn method_is_case_insensitive() {
        let mut parser = new_parser();
        let head = parser.feed(b"get / HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.method, Method::GET);
    }

    #[test]
    fn oversized_head_fails_deterministically() {
        let mut data = b"GET / HTTP/1.1\r\n".to_vec();
        while data.len() <= 8192 {
            data.extend_from_slice(b"X-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        data.extend_from_slice(b"\r\n");

        for size in [1, 7, 512, data.len()] {
            let mut parser = new_parser();
            let err = data
                .chunks(size)
                .find_map(|chunk| parser.feed(chunk).err())
                .expect("head too large");
            assert_eq!(err, ParseError::HeaderTooLarge(8192));
            assert_eq!(err.status(), StatusCode::PayloadTooLarge);
        }
    }

    #[test]
    fn buffer_grows_for_long_lines() {
        let mut parser = new_parser();
        assert_eq!(parser.capacity(), 4096);
        let line = format!("GET /{} HTTP/1.1", "a".repeat(3800));
        parser.feed(line.as_bytes()).unwrap();
        assert_eq!(parser.capacity(), 8192);
    }

    #[test]
    fn cap_counts_head_bytes_not_capacity() {
        let mut parser = new_parser();
        let line = format!("GET /{}", "a".repeat(8187));
        parser.feed(line.as_bytes()).unwrap();
        assert_eq!(parser.capacity(), 8192);
        let err = parser.feed(b"b").unwrap_err();
        assert_eq!(err, ParseError::HeaderTooLarge(8192));
    }

    #[test]
    fn post_without_length_is_rejected() {
        let mut parser = new_parser();
        let err = parser.feed(b"POST /form HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), StatusCode::LengthRequired);
    }

    #[test]
    fn chunked_request_body_is_rejected() {
        let mut parser = new_parser();
        let err = parser
            .feed(b"PUT /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap_err();
        assert_eq!(err, ParseError::LengthRequired);
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut parser = new_parser();
        let err = parser
            .feed(b"POST /x HTTP/1.1\r\nContent-Length: 4096\r\n\r\n")
            .unwrap_err();
        assert_eq!(err, ParseError::PayloadTooLarge(4096));
    }

    #[test]
    fn body_bytes_remain_buffered() {
        let mut parser = new_parser();
        let head = parser
            .feed(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel")
            .unwrap()
            .unwrap();
        assert_eq!(head.content_length, 5);
        assert_eq!(parser.phase(), Phase::Body);
        assert_eq!(parser.feed(b"lo").unwrap(), None);
        assert_eq!(&parser.take_remaining()[..], b"hello");
    }

    #[test]
    fn reset_forgets_previous_request() {
        let mut parser = new_parser();
        parser
            .feed(b"GET /a HTTP/1.1\r\nCookie: a=1\r\nX-A: 1\r\n\r\n")
            .unwrap()
            .unwrap();
        parser.reset();

        let head = parser.feed(b"GET /b HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.path, "/b");
        assert!(head.cookies.is_empty());
        assert!(head.headers.is_empty());
    }

    #[test]
    fn continuation_without_field_is_rejected() {
        let mut parser = new_parser();
        assert_eq!(
            parser.feed(b"GET / HTTP/1.1\r\n folded\r\n"),
            Err(ParseError::BadRequest)
        );
    }

    #[test]
    fn decode_handles_escapes_in_order() {
        assert_eq!(decode("a+b%20c%2Bd").unwrap(), "a b c+d");
        assert_eq!(decode("%E2%82%AC").unwrap(), "\u{20ac}");
        assert_eq!(decode("100%"), Err(ParseError::MalformedEscape));
        assert_eq!(decode("%zz"), Err(ParseError::MalformedEscape));
    }

    #[test]
    fn decode_is_identity_without_escapes() {
        for s in ["plain", "/path/to/file.html", "a=b&c=d", "ünïcødé"] {
            assert_eq!(decode(s).unwrap(), s);
            assert_eq!(decode(&decode(s).unwrap()).unwrap(), s);
        }
    }

    #[test]
    fn query_skips_pairs_without_value() {
        let params = parse_query("flag&k+ey=v+1&=empty&x=").unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params["k ey"], "v 1");
        assert_eq!(params["x"], "");
    }
}
