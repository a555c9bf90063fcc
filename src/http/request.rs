use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use url::Url;

use crate::http::buffer::Body;
use crate::http::cookie::Cookie;
use crate::http::parser::{self, ParseError, RequestHead};
use crate::http::session::{SESSION_COOKIE, Session, SessionTable};
use crate::http::writer::ResponseWriter;

/// HTTP request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// TRACE - Echo the request back
    TRACE,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// CONNECT - Tunnel through the server
    CONNECT,
    /// PATCH - Partial modification of a resource
    PATCH,
}

impl Method {
    /// Parses an HTTP method, ignoring ASCII case.
    ///
    /// # Example
    ///
    /// ```
    /// # use nbhttp::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("post"), Some(Method::POST));
    /// assert_eq!(Method::from_str("BREW"), None);
    /// ```
    pub fn from_str(s: &str) -> Option<Self> {
        let method = match s.to_ascii_uppercase().as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            "TRACE" => Method::TRACE,
            "OPTIONS" => Method::OPTIONS,
            "CONNECT" => Method::CONNECT,
            "PATCH" => Method::PATCH,
            _ => return None,
        };
        Some(method)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::TRACE => "TRACE",
            Method::OPTIONS => "OPTIONS",
            Method::CONNECT => "CONNECT",
            Method::PATCH => "PATCH",
        }
    }

    /// Methods that must announce a body length.
    pub fn requires_body(&self) -> bool {
        matches!(self, Method::POST | Method::PUT)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed request as seen by a handler.
///
/// Header names are stored lower-cased. Cookies sent in `Cookie` headers
/// are kept apart from the other headers. `params` holds the decoded query
/// string and, for urlencoded POSTs, the form fields.
pub struct Request {
    pub method: Method,
    /// Request target exactly as received
    pub uri: String,
    /// Decoded path without the query string
    pub path: String,
    pub query: Option<String>,
    /// HTTP version (typically "HTTP/1.1")
    pub version: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub params: HashMap<String, String>,
    body: Body,
    secure: bool,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    sessions: Option<Arc<SessionTable>>,
}

impl Request {
    pub fn from_head(head: RequestHead, body: Body) -> Self {
        Self {
            method: head.method,
            uri: head.uri,
            path: head.path,
            query: head.query,
            version: head.version,
            headers: head.headers,
            cookies: head.cookies,
            params: head.params,
            body,
            secure: false,
            peer_addr: None,
            local_addr: None,
            sessions: None,
        }
    }

    pub(crate) fn attach(
        &mut self,
        secure: bool,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        sessions: Arc<SessionTable>,
    ) {
        self.secure = secure;
        self.peer_addr = Some(peer_addr);
        self.local_addr = Some(local_addr);
        self.sessions = Some(sessions);
    }

    /// Looks up a header by name, ignoring case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|v| v.as_str())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|v| v.as_str())
    }

    /// The request body. Empty for requests without `Content-Length`.
    pub fn body(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Returns the Content-Length header as a number, 0 when absent or invalid.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Whether the client asked to reuse the connection.
    pub fn keep_alive(&self) -> bool {
        self.header("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
    }

    /// Media type from `Content-Type`, without parameters, lower-cased.
    pub fn content_type(&self) -> Option<String> {
        self.header("Content-Type").map(|v| {
            v.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Absolute URL of the request, built from scheme, `Host` and target.
    pub fn url(&self) -> Result<Url, url::ParseError> {
        let scheme = if self.secure { "https" } else { "http" };
        let host = match (self.header("Host"), self.local_addr) {
            (Some(host), _) => host.to_string(),
            (None, Some(addr)) => addr.to_string(),
            (None, None) => "localhost".to_string(),
        };
        Url::parse(&format!("{}://{}{}", scheme, host, self.uri))
    }

    /// Returns the caller's session, creating one if needed.
    ///
    /// A new session is announced to the client with an `ISSESSIONID`
    /// cookie on `resp`. Returns `None` for requests not served through a
    /// server, which have no session table.
    pub fn session(&mut self, resp: &mut ResponseWriter) -> Option<Arc<Session>> {
        let sessions = self.sessions.clone()?;
        if let Some(session) = self.cookie(SESSION_COOKIE).and_then(|id| sessions.get(id)) {
            return Some(session);
        }

        let session = sessions.create();
        let mut cookie = Cookie::new(SESSION_COOKIE, session.id());
        cookie.set_path("/");
        resp.add_cookie(cookie);
        self.cookies
            .insert(SESSION_COOKIE.to_string(), session.id().to_string());
        Some(session)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("cookies", &self.cookies)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Builder for constructing requests outside a live connection.
pub struct RequestBuilder {
    method: Option<Method>,
    uri: Option<String>,
    version: Option<String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            uri: None,
            version: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Renders the request to wire format and runs it through the parser,
    /// so built requests see exactly what a connection would produce.
    pub fn build(self) -> Result<Request, ParseError> {
        let method = self.method.ok_or(ParseError::BadRequest)?;
        let uri = self.uri.ok_or(ParseError::BadRequest)?;
        let version = self.version.unwrap_or_else(|| "HTTP/1.1".to_string());

        let mut wire = format!("{} {} {}\r\n", method, uri, version);
        for (key, value) in &self.headers {
            wire.push_str(&format!("{}: {}\r\n", key, value));
        }
        let has_length = self
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-length"));
        if !has_length && (method.requires_body() || !self.body.is_empty()) {
            wire.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        wire.push_str("\r\n");

        let mut parser = parser::RequestParser::new(Default::default(), usize::MAX);
        let head = parser.feed(wire.as_bytes())?.ok_or(ParseError::BadRequest)?;

        let queue = crate::http::buffer::BufferQueue::new(self.body.len().max(1));
        queue.write(&self.body);
        queue.stop();
        let body = Body::new(Arc::new(queue), std::time::Duration::ZERO);

        Ok(Request::from_head(head, body))
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
