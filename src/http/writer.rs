use std::io;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;

use crate::http::buffer::BufferQueue;
use crate::http::cookie::{Cookie, HTTP_DATE};
use crate::http::encoding::Encoder;
use crate::http::response::StatusCode;

const HTTP_VERSION: &str = "HTTP/1.1";

/// Bytes written since the last flush that trigger an implicit flush.
const AUTO_FLUSH_SEGMENTS: usize = 16;

/// Something that moves queued response bytes to the client.
pub trait FlushTarget: Send + Sync {
    /// Blocks until every segment sealed in `queue` has been written, or
    /// the connection failed.
    fn drain(&self, queue: &Arc<BufferQueue>) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Undecided,
    /// Body bytes go out as written, delimited by length or by close.
    Identity,
    Chunked,
}

/// Builds a complete minimal error response, for use before any handler runs.
pub fn render_error(status: StatusCode) -> Bytes {
    let body = format!("{}\n", status);
    let head = format!(
        "{} {}\r\nDate: {}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        HTTP_VERSION,
        status,
        Utc::now().format(HTTP_DATE),
        body.len()
    );
    Bytes::from(head + &body)
}

/// Streams one response into a connection's output queue.
///
/// The header block is assembled once, on the first flush, and placed in
/// front of any body bytes already queued. Every flush blocks the calling
/// thread until the connection has written the queued bytes.
///
/// Keep-alive responses finished in a single flush carry `Content-Length`;
/// after an earlier flush the body is chunked. With an encoder attached the
/// body is always chunked. Other responses are delimited by closing the
/// connection.
pub struct ResponseWriter {
    target: Arc<dyn FlushTarget>,
    queue: Arc<BufferQueue>,
    status: StatusCode,
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
    keep_alive: bool,
    encoder: Option<Box<dyn Encoder>>,
    framing: Framing,
    staged: Vec<u8>,
    unflushed: usize,
    header_sent: bool,
    ignore_body: bool,
    finished: bool,
}

impl ResponseWriter {
    pub fn new(target: Arc<dyn FlushTarget>, queue: Arc<BufferQueue>, keep_alive: bool) -> Self {
        Self {
            target,
            queue,
            status: StatusCode::Ok,
            headers: Vec::new(),
            cookies: Vec::new(),
            keep_alive,
            encoder: None,
            framing: Framing::Undecided,
            staged: Vec::new(),
            unflushed: 0,
            header_sent: false,
            ignore_body: false,
            finished: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Sets a header, replacing any earlier value with the same name.
    ///
    /// `Connection` is managed by the writer: setting it to anything but
    /// `keep-alive` makes the response close the connection.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if name.eq_ignore_ascii_case("connection") {
            self.keep_alive &= value.eq_ignore_ascii_case("keep-alive");
            if self.writes_directly() && !self.staged.is_empty() {
                let staged = std::mem::take(&mut self.staged);
                self.queue.write(&staged);
            }
            return;
        }
        match self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    pub fn contains_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn add_cookie(&mut self, cookie: Cookie) {
        self.cookies.push(cookie);
    }

    pub fn set_encoder(&mut self, encoder: Box<dyn Encoder>) {
        if !self.header_sent && self.staged.is_empty() {
            self.encoder = Some(encoder);
        }
    }

    /// Discards the body, keeping the headers. Used for HEAD.
    pub fn ignore_body(&mut self) {
        self.ignore_body = true;
        self.encoder = None;
    }

    pub fn header_sent(&self) -> bool {
        self.header_sent
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the connection stays open after this response.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    fn body_allowed(&self) -> bool {
        !self.ignore_body && !self.status.forbids_body()
    }

    fn writes_directly(&self) -> bool {
        self.encoder.is_none()
            && (self.framing == Framing::Identity || (!self.header_sent && !self.keep_alive))
    }

    /// Appends body bytes.
    pub fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        if self.finished {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "response already finished"));
        }
        if data.is_empty() || !self.body_allowed() {
            return Ok(());
        }

        if let Some(encoder) = self.encoder.as_mut() {
            encoder.compress(data)?;
        } else if self.writes_directly() {
            self.queue.write(data);
        } else {
            self.staged.extend_from_slice(data);
        }

        self.unflushed += data.len();
        if self.unflushed >= self.queue.segment_size() * AUTO_FLUSH_SEGMENTS {
            self.flush()?;
        }
        Ok(())
    }

    /// Sends everything written so far and waits until it left the socket.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.flush_inner(false)
    }

    /// Completes the response. Further writes fail.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        let result = self.flush_inner(true);
        self.finished = true;
        result
    }

    /// Replaces any unsent body with a short error page and finishes.
    pub fn send_error(&mut self, status: StatusCode) -> io::Result<()> {
        if self.header_sent {
            return Err(io::Error::other("response already committed"));
        }
        self.staged.clear();
        self.queue.clear();
        if self.encoder.is_some() {
            self.encoder = None;
        }
        self.unflushed = 0;
        self.framing = Framing::Undecided;
        self.status = status;
        self.set_header("Content-Type", "text/plain");
        if self.body_allowed() {
            let body = format!("{}\n", status);
            self.write_body(body.as_bytes())?;
        }
        self.finish()
    }

    /// Redirects the client with `302 Found`.
    pub fn send_redirect(&mut self, location: &str) -> io::Result<()> {
        if self.header_sent {
            return Err(io::Error::other("response already committed"));
        }
        self.staged.clear();
        self.queue.clear();
        self.status = StatusCode::Found;
        self.set_header("Location", location);
        self.finish()
    }

    fn flush_inner(&mut self, last: bool) -> io::Result<()> {
        let mut content_length = None;
        if self.framing == Framing::Undecided {
            self.framing = if self.encoder.is_some() {
                Framing::Chunked
            } else if !self.keep_alive || self.contains_header("content-length") {
                Framing::Identity
            } else if last {
                if self.body_allowed() {
                    content_length = Some(self.staged.len());
                }
                Framing::Identity
            } else {
                Framing::Chunked
            };
        }

        // Rendered before the encoder is consumed.
        if !self.header_sent {
            let head = self.render_head(content_length);
            self.queue.push_front(Bytes::from(head));
            self.header_sent = true;
        }

        match self.framing {
            Framing::Chunked => {
                let mut chunk = match self.encoder.as_mut() {
                    Some(encoder) => encoder.flush()?.unwrap_or_default(),
                    None => std::mem::take(&mut self.staged),
                };
                if last {
                    if let Some(encoder) = self.encoder.take() {
                        chunk.extend(encoder.finish()?);
                    }
                }
                if !chunk.is_empty() {
                    self.queue.write(format!("{:x}\r\n", chunk.len()).as_bytes());
                    self.queue.write(&chunk);
                    self.queue.write(b"\r\n");
                }
                if last {
                    self.queue.write(b"0\r\n\r\n");
                }
            }
            Framing::Identity => {
                if !self.staged.is_empty() {
                    let staged = std::mem::take(&mut self.staged);
                    self.queue.write(&staged);
                }
            }
            Framing::Undecided => {}
        }

        if last {
            self.queue.stop();
        } else {
            self.queue.seal();
        }
        self.unflushed = 0;
        self.target.drain(&self.queue)
    }

    fn render_head(&self, content_length: Option<usize>) -> Vec<u8> {
        let mut head = format!("{} {}\r\n", HTTP_VERSION, self.status);
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !self.contains_header("date") {
            head.push_str(&format!("Date: {}\r\n", Utc::now().format(HTTP_DATE)));
        }
        if !self.keep_alive {
            head.push_str("Connection: close\r\n");
        }
        if let Some(length) = content_length {
            head.push_str(&format!("Content-Length: {}\r\n", length));
        }
        if self.framing == Framing::Chunked {
            if let Some(encoder) = &self.encoder {
                head.push_str(&format!("Content-Encoding: {}\r\n", encoder.name()));
            }
            head.push_str("Transfer-Encoding: chunked\r\n");
        }
        let now = Utc::now();
        for cookie in &self.cookies {
            head.push_str(&format!("Set-Cookie: {}\r\n", cookie.header_value(now)));
        }
        head.push_str("\r\n");
        head.into_bytes()
    }
}

impl io::Write for ResponseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_body(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        ResponseWriter::flush(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::http::encoding::GzipEncoder;
    use flate2::read::GzDecoder;
    use std::io::{Read, Write};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Collects everything drained from the queue.
    #[derive(Default)]
    pub(crate) struct Collect {
        pub(crate) out: Mutex<Vec<u8>>,
        pub(crate) drains: AtomicUsize,
    }

    impl FlushTarget for Collect {
        fn drain(&self, queue: &Arc<BufferQueue>) -> io::Result<()> {
            self.drains.fetch_add(1, Ordering::SeqCst);
            let mut out = self.out.lock().unwrap();
            while let Some(segment) = queue.try_pop() {
                out.extend_from_slice(&segment);
            }
            Ok(())
        }
    }

    struct Broken;

    impl FlushTarget for Broken {
        fn drain(&self, _: &Arc<BufferQueue>) -> io::Result<()> {
            Err(io::ErrorKind::ConnectionReset.into())
        }
    }

    fn writer(keep_alive: bool) -> (ResponseWriter, Arc<Collect>) {
        let target = Arc::new(Collect::default());
        let queue = Arc::new(BufferQueue::new(8));
        (ResponseWriter::new(target.clone(), queue, keep_alive), target)
    }

    fn split(target: &Collect) -> (Vec<String>, Vec<u8>) {
        let out = target.out.lock().unwrap().clone();
        let end = out.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        let head = String::from_utf8(out[..end].to_vec()).unwrap();
        let lines = head.split("\r\n").map(str::to_string).collect();
        (lines, out[end + 4..].to_vec())
    }

    pub(crate) fn dechunk(mut body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let line_end = body.windows(2).position(|w| w == b"\r\n").unwrap();
            let size = usize::from_str_radix(std::str::from_utf8(&body[..line_end]).unwrap(), 16).unwrap();
            body = &body[line_end + 2..];
            if size == 0 {
                assert_eq!(body, b"\r\n");
                return out;
            }
            out.extend_from_slice(&body[..size]);
            assert_eq!(&body[size..size + 2], b"\r\n");
            body = &body[size + 2..];
        }
    }

    #[test]
    fn close_mode_streams_raw_body() {
        let (mut resp, target) = writer(false);
        resp.set_header("Content-Type", "text/plain");
        resp.write_all(b"hello world, this spans segments").unwrap();
        resp.finish().unwrap();

        let (head, body) = split(&target);
        assert_eq!(head[0], "HTTP/1.1 200 OK");
        assert_eq!(head[1], "Content-Type: text/plain");
        assert!(head[2].starts_with("Date: "));
        assert!(head[2].ends_with(" GMT"));
        assert_eq!(head[3], "Connection: close");
        assert_eq!(head.len(), 4);
        assert_eq!(body, b"hello world, this spans segments");
    }

    #[test]
    fn keep_alive_single_flush_has_length() {
        let (mut resp, target) = writer(true);
        resp.write_body(b"hello").unwrap();
        resp.finish().unwrap();

        let (head, body) = split(&target);
        assert!(head.contains(&"Content-Length: 5".to_string()));
        assert!(!head.iter().any(|h| h.starts_with("Connection")));
        assert_eq!(body, b"hello");
        assert_eq!(target.drains.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn keep_alive_early_flush_is_chunked() {
        let (mut resp, target) = writer(true);
        resp.write_body(b"hello").unwrap();
        resp.flush().unwrap();
        resp.write_body(b" world").unwrap();
        resp.flush().unwrap();
        resp.flush().unwrap();
        resp.finish().unwrap();

        let (head, body) = split(&target);
        assert!(head.contains(&"Transfer-Encoding: chunked".to_string()));
        assert!(!head.iter().any(|h| h.starts_with("Content-Length")));
        assert_eq!(body, b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");
        assert_eq!(dechunk(&body), b"hello world");
    }

    #[test]
    fn gzip_body_is_chunked_and_decodes() {
        let (mut resp, target) = writer(false);
        resp.set_encoder(Box::new(GzipEncoder::new()));
        let text = "compress me please ".repeat(50);
        resp.write_body(text.as_bytes()).unwrap();
        resp.flush().unwrap();
        resp.write_body(b"tail").unwrap();
        resp.finish().unwrap();

        let (head, body) = split(&target);
        assert!(head.contains(&"Content-Encoding: gzip".to_string()));
        assert!(head.contains(&"Transfer-Encoding: chunked".to_string()));

        let mut plain = String::new();
        GzDecoder::new(&dechunk(&body)[..]).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, text + "tail");
    }

    #[test]
    fn headers_keep_wire_order() {
        let (mut resp, target) = writer(false);
        resp.set_status(StatusCode::Created);
        resp.set_header("X-First", "1");
        resp.set_header("X-Second", "2");
        resp.set_header("x-first", "one");
        resp.add_cookie(Cookie::new("a", "1"));
        resp.add_cookie(Cookie::new("b", "2"));
        resp.finish().unwrap();

        let (head, _) = split(&target);
        assert_eq!(head[0], "HTTP/1.1 201 Created");
        assert_eq!(head[1], "X-First: one");
        assert_eq!(head[2], "X-Second: 2");
        assert!(head[3].starts_with("Date: "));
        assert_eq!(head[4], "Connection: close");
        assert_eq!(head[5], "Set-Cookie: a=1");
        assert_eq!(head[6], "Set-Cookie: b=2");
    }

    #[test]
    fn send_error_discards_body() {
        let (mut resp, target) = writer(true);
        resp.write_body(b"partial output").unwrap();
        resp.send_error(StatusCode::NotFound).unwrap();

        let (head, body) = split(&target);
        assert_eq!(head[0], "HTTP/1.1 404 Not Found");
        assert_eq!(body, b"404 Not Found\n");
        assert!(resp.is_finished());
        assert!(resp.write_body(b"more").is_err());
    }

    struct Unnamed;

    impl Encoder for Unnamed {
        fn name(&self) -> &'static str {
            panic!("no name")
        }

        fn compress(&mut self, _: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn flush(&mut self) -> io::Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn finish(self: Box<Self>) -> io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn error_page_after_failed_render() {
        let (mut resp, target) = writer(true);
        resp.set_encoder(Box::new(Unnamed));
        resp.write_body(b"lost").unwrap();
        let rendered = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| resp.finish()));
        assert!(rendered.is_err());
        assert!(!resp.header_sent());
        assert!(!resp.is_finished());

        resp.send_error(StatusCode::InternalServerError).unwrap();
        let (head, body) = split(&target);
        assert_eq!(head[0], "HTTP/1.1 500 Internal Server Error");
        assert!(head.contains(&"Content-Length: 26".to_string()));
        assert_eq!(body, b"500 Internal Server Error\n");
    }

    #[test]
    fn send_error_after_commit_fails() {
        let (mut resp, _target) = writer(false);
        resp.write_body(b"x").unwrap();
        resp.flush().unwrap();
        assert!(resp.send_error(StatusCode::InternalServerError).is_err());
    }

    #[test]
    fn redirect_sets_location() {
        let (mut resp, target) = writer(false);
        resp.send_redirect("/elsewhere").unwrap();

        let (head, body) = split(&target);
        assert_eq!(head[0], "HTTP/1.1 302 Found");
        assert!(head.contains(&"Location: /elsewhere".to_string()));
        assert!(body.is_empty());
    }

    #[test]
    fn head_response_has_no_body() {
        let (mut resp, target) = writer(true);
        resp.ignore_body();
        resp.write_body(b"invisible").unwrap();
        resp.finish().unwrap();

        let (head, body) = split(&target);
        assert!(!head.iter().any(|h| h.starts_with("Content-Length")));
        assert!(body.is_empty());
    }

    #[test]
    fn connection_header_forces_close() {
        let (mut resp, target) = writer(true);
        resp.set_header("Connection", "close");
        assert!(!resp.keep_alive());
        resp.finish().unwrap();

        let (head, _) = split(&target);
        assert!(head.contains(&"Connection: close".to_string()));
    }

    #[test]
    fn failed_drain_is_reported() {
        let mut resp = ResponseWriter::new(Arc::new(Broken), Arc::new(BufferQueue::new(8)), false);
        resp.write_body(b"data").unwrap();
        assert!(resp.finish().is_err());
    }

    #[test]
    fn error_page_is_complete() {
        let page = render_error(StatusCode::LengthRequired);
        let text = std::str::from_utf8(&page).unwrap();
        assert!(text.starts_with("HTTP/1.1 411 Length Required\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n411 Length Required\n"));
    }
}
