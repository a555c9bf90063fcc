use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use mio::Token;
use mio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::http::buffer::{Body, BufferQueue};
use crate::http::context::{Route, Router, dispatch};
use crate::http::encoding::EncodingRegistry;
use crate::http::parser::{RequestHead, RequestParser};
use crate::http::request::Request;
use crate::http::response::StatusCode;
use crate::http::session::SessionTable;
use crate::http::writer::{FlushTarget, ResponseWriter, render_error};
use crate::reactor::{Callback, Reactor};
use crate::tls::{RustlsEngine, TlsEngine, TlsError, Transfer};

/// How long a handler may wait on a body read. Bodies are complete before
/// dispatch, so this only guards against misuse.
const BODY_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-wide state every connection reads.
pub(crate) struct Shared {
    pub(crate) router: Router,
    pub(crate) sessions: Arc<SessionTable>,
    pub(crate) encodings: EncodingRegistry,
    pub(crate) config: Config,
    pub(crate) tls: Option<Arc<rustls::ServerConfig>>,
}

struct Transport {
    stream: TcpStream,
    tls: Option<TlsEngine>,
}

enum Inbound {
    Head,
    Body {
        head: RequestHead,
        route: Route,
        remaining: usize,
        queue: Arc<BufferQueue>,
    },
    /// Handed to a worker; nothing is parsed until the keep-alive reset.
    Dispatched,
}

struct InboundState {
    parser: RequestParser,
    stage: Inbound,
    /// Bytes received past the current request.
    carry: BytesMut,
}

enum DrainWaiter {
    Worker(oneshot::Sender<io::Result<()>>),
    /// Close once the queue is written, used for error responses.
    Close,
}

#[derive(Default)]
struct OutputState {
    in_flight: Option<Bytes>,
    waiter: Option<DrainWaiter>,
}

struct Job {
    head: RequestHead,
    route: Route,
    body: Arc<BufferQueue>,
}

enum Step {
    Continue,
    Reject(StatusCode),
    Dispatch(Job),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// One accepted socket and the request currently travelling over it.
///
/// The reactor thread reads and parses until a request and its body are
/// complete, then disarms reads and hands the connection to a worker. The
/// worker's [`ResponseWriter`] fills `queue` and parks in
/// [`FlushTarget::drain`] while the reactor writes it out. After the
/// response the connection is either closed or reset for the next request.
///
/// Lock order is `output` before `io`; `inbound` is never held together
/// with either.
pub struct Connection {
    token: Token,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    reactor: Reactor,
    shared: Arc<Shared>,
    io: Mutex<Option<Transport>>,
    inbound: Mutex<InboundState>,
    output: Mutex<OutputState>,
    queue: Arc<BufferQueue>,
    /// Write callback displaced while a handshake flight drains.
    takeover: Mutex<Option<Option<Callback>>>,
    handshaking: AtomicBool,
    closed: AtomicBool,
    me: Weak<Connection>,
}

impl Connection {
    pub(crate) fn open(
        stream: TcpStream,
        peer_addr: SocketAddr,
        reactor: Reactor,
        shared: Arc<Shared>,
    ) -> io::Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let tls = match &shared.tls {
            Some(config) => {
                let engine = RustlsEngine::new(config.clone()).map_err(io::Error::other)?;
                Some(TlsEngine::new(Box::new(engine)))
            }
            None => None,
        };
        let secure = tls.is_some();
        let token = reactor.attach(stream.as_raw_fd());
        let cfg = &shared.config;
        let parser = RequestParser::new(cfg.header_buffer, cfg.max_body_size);
        let queue = Arc::new(BufferQueue::new(cfg.segment_size));

        let conn = Arc::new_cyclic(|me| Connection {
            token,
            peer_addr,
            local_addr,
            reactor: reactor.clone(),
            shared: shared.clone(),
            io: Mutex::new(Some(Transport { stream, tls })),
            inbound: Mutex::new(InboundState {
                parser,
                stage: Inbound::Head,
                carry: BytesMut::new(),
            }),
            output: Mutex::new(OutputState::default()),
            queue,
            takeover: Mutex::new(None),
            handshaking: AtomicBool::new(secure),
            closed: AtomicBool::new(false),
            me: me.clone(),
        });

        if let Err(e) = conn.arm_read() {
            conn.close();
            return Err(e);
        }
        info!(token = token.0, peer = %peer_addr, secure, "Accepted connection");
        Ok(conn)
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_secure(&self) -> bool {
        self.shared.tls.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_dispatched(&self) -> bool {
        matches!(lock(&self.inbound).stage, Inbound::Dispatched)
    }

    fn callback(&self, f: fn(&Arc<Connection>)) -> io::Result<Callback> {
        let conn = self
            .me
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection dropped"))?;
        Ok(Arc::new(move |_: &Reactor| f(&conn)))
    }

    fn arm_read(&self) -> io::Result<()> {
        let cb = self.callback(Connection::on_readable)?;
        self.reactor.register_read(self.token, cb).map(|_| ())
    }

    fn arm_write(&self) -> io::Result<()> {
        let cb = self.callback(Connection::on_writable)?;
        self.reactor.register_write(self.token, cb).map(|_| ())
    }

    fn on_readable(self: &Arc<Self>) {
        if self.is_closed() || self.is_dispatched() {
            return;
        }
        match self.advance_handshake() {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(token = self.token.0, peer = %self.peer_addr, "TLS handshake failed: {}", e);
                self.close();
                return;
            }
        }

        let mut scratch = vec![0u8; self.queue.segment_size()];
        loop {
            let n = match self.read_socket(&mut scratch) {
                Ok(Transfer::Bytes(n)) => n,
                Ok(Transfer::WouldBlock) => return,
                Ok(Transfer::Closed) => {
                    trace!(token = self.token.0, "Peer closed connection");
                    self.close();
                    return;
                }
                Err(e) => {
                    warn!(token = self.token.0, peer = %self.peer_addr, "Read failed: {}", e);
                    self.close();
                    return;
                }
            };
            trace!(token = self.token.0, bytes = n, "Read request bytes");

            match self.ingest(&scratch[..n]) {
                Step::Continue => {}
                Step::Reject(status) => return self.reject(status),
                Step::Dispatch(job) => return self.dispatch(job),
            }
        }
    }

    /// Runs the handshake until it finishes or the socket blocks.
    ///
    /// While a handshake flight is stuck in the engine the connection
    /// takes over the write slot, and restores whatever was there once the
    /// handshake completes.
    fn advance_handshake(self: &Arc<Self>) -> Result<bool, TlsError> {
        if !self.handshaking.load(Ordering::Acquire) {
            return Ok(true);
        }
        let (done, pending) = {
            let mut io = lock(&self.io);
            let transport = io.as_mut().ok_or(TlsError::Closed)?;
            let Some(tls) = transport.tls.as_mut() else {
                return Ok(true);
            };
            let done = tls.handshake(&mut transport.stream)?;
            (done, tls.has_pending_output())
        };

        let mut takeover = lock(&self.takeover);
        if done {
            self.handshaking.store(false, Ordering::Release);
            if let Some(previous) = takeover.take() {
                match previous {
                    Some(cb) => self.reactor.register_write(self.token, cb)?,
                    None => {
                        self.reactor.unregister_write(self.token)?;
                        None
                    }
                };
            }
            trace!(token = self.token.0, "TLS handshake finished");
        } else if pending && takeover.is_none() {
            let conn = self.clone();
            let cb: Callback = Arc::new(move |_: &Reactor| conn.on_handshake_writable());
            *takeover = Some(self.reactor.register_write(self.token, cb)?);
        }
        Ok(done)
    }

    fn on_handshake_writable(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        match self.advance_handshake() {
            // Plaintext may already be buffered behind the last flight.
            Ok(true) => self.on_readable(),
            Ok(false) => {}
            Err(e) => {
                warn!(token = self.token.0, "TLS handshake failed: {}", e);
                self.close();
            }
        }
    }

    fn read_socket(&self, dst: &mut [u8]) -> io::Result<Transfer> {
        let mut io = lock(&self.io);
        let transport = io
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
        if let Some(tls) = transport.tls.as_mut() {
            return tls.read(&mut transport.stream, dst).map_err(io::Error::other);
        }
        loop {
            match transport.stream.read(dst) {
                Ok(0) => return Ok(Transfer::Closed),
                Ok(n) => return Ok(Transfer::Bytes(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Transfer::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Feeds bytes to the parser or the pending body. Carried-over bytes
    /// from a previous request always go first.
    fn ingest(&self, data: &[u8]) -> Step {
        let mut inbound = lock(&self.inbound);
        let inbound = &mut *inbound;

        let combined;
        let data = if inbound.carry.is_empty() {
            data
        } else {
            let mut all = inbound.carry.split();
            all.extend_from_slice(data);
            combined = all;
            &combined[..]
        };

        match std::mem::replace(&mut inbound.stage, Inbound::Dispatched) {
            Inbound::Dispatched => {
                inbound.carry.extend_from_slice(data);
                Step::Continue
            }
            Inbound::Head => match inbound.parser.feed(data) {
                Ok(None) => {
                    inbound.stage = Inbound::Head;
                    Step::Continue
                }
                Ok(Some(head)) => self.begin_body(inbound, head),
                Err(e) => {
                    debug!(token = self.token.0, peer = %self.peer_addr, "Bad request: {}", e);
                    Step::Reject(e.status())
                }
            },
            Inbound::Body {
                head,
                route,
                remaining,
                queue,
            } => Self::fill_body(inbound, head, route, remaining, queue, data),
        }
    }

    fn begin_body(&self, inbound: &mut InboundState, head: RequestHead) -> Step {
        let Some(route) = self.shared.router.resolve(&head.path).cloned() else {
            debug!(token = self.token.0, path = %head.path, "No context");
            return Step::Reject(StatusCode::NotFound);
        };
        if route
            .options
            .max_content_length
            .is_some_and(|max| head.content_length > max)
        {
            return Step::Reject(StatusCode::PayloadTooLarge);
        }

        let queue = Arc::new(BufferQueue::new(self.queue.segment_size()));
        let buffered = inbound.parser.take_remaining();
        let remaining = head.content_length;
        Self::fill_body(inbound, head, route, remaining, queue, &buffered)
    }

    fn fill_body(
        inbound: &mut InboundState,
        head: RequestHead,
        route: Route,
        remaining: usize,
        queue: Arc<BufferQueue>,
        data: &[u8],
    ) -> Step {
        let take = remaining.min(data.len());
        queue.write(&data[..take]);
        inbound.carry.extend_from_slice(&data[take..]);

        let remaining = remaining - take;
        if remaining > 0 {
            inbound.stage = Inbound::Body {
                head,
                route,
                remaining,
                queue,
            };
            return Step::Continue;
        }
        queue.stop();
        inbound.stage = Inbound::Dispatched;
        Step::Dispatch(Job {
            head,
            route,
            body: queue,
        })
    }

    /// Answers with a bare error page and closes once it is written.
    fn reject(self: &Arc<Self>, status: StatusCode) {
        debug!(token = self.token.0, peer = %self.peer_addr, status = status.as_u16(), "Rejecting request");
        let _ = self.reactor.unregister_read(self.token);
        {
            let mut output = lock(&self.output);
            self.queue.reset();
            self.queue.push_back(render_error(status));
            self.queue.stop();
            output.waiter = Some(DrainWaiter::Close);
        }
        if self.arm_write().is_err() {
            self.close();
        }
    }

    fn dispatch(self: &Arc<Self>, job: Job) {
        if let Err(e) = self.reactor.unregister_read(self.token) {
            warn!(token = self.token.0, "Failed to disarm reads: {}", e);
            self.close();
            return;
        }
        let conn = self.clone();
        self.reactor.submit_work(Box::new(move || conn.serve(job)));
    }

    /// Runs the handler for one request on a worker thread.
    fn serve(self: &Arc<Self>, job: Job) {
        let Job { head, route, body } = job;
        let keep_alive = head.keep_alive;
        debug!(
            token = self.token.0,
            method = %head.method,
            path = %head.path,
            "Dispatching request"
        );

        let mut req = Request::from_head(head, Body::new(body, BODY_TIMEOUT));
        req.attach(
            self.is_secure(),
            self.peer_addr,
            self.local_addr,
            self.shared.sessions.clone(),
        );

        self.queue.reset();
        let target: Arc<dyn FlushTarget> = self.clone();
        let mut resp = ResponseWriter::new(target, self.queue.clone(), keep_alive);
        if route.options.accept_encoding {
            if let Some(encoder) = req
                .header("Accept-Encoding")
                .and_then(|accept| self.shared.encodings.select(accept))
            {
                resp.set_encoder(encoder);
            }
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            dispatch(route.context.as_ref(), &mut req, &mut resp)
        }));
        let mut failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(_) => Some("handler panicked".to_string()),
        };
        if failure.is_none() {
            match panic::catch_unwind(AssertUnwindSafe(|| resp.finish())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(token = self.token.0, "Response not delivered: {}", e);
                    self.close();
                    return;
                }
                Err(_) => failure = Some("response rendering panicked".to_string()),
            }
        }
        if let Some(reason) = failure {
            warn!(token = self.token.0, path = %req.path, "Handler failed: {}", reason);
            let recovered = !resp.header_sent()
                && matches!(
                    panic::catch_unwind(AssertUnwindSafe(|| resp.send_error(StatusCode::InternalServerError))),
                    Ok(Ok(()))
                );
            if !recovered {
                self.close();
                return;
            }
        }
        if resp.keep_alive() && !self.is_closed() {
            self.reset_for_next();
        } else {
            self.close();
        }
    }

    /// Prepares for the next request and re-arms reads.
    fn reset_for_next(self: &Arc<Self>) {
        let pipelined = {
            let mut inbound = lock(&self.inbound);
            inbound.parser.reset();
            inbound.stage = Inbound::Head;
            !inbound.carry.is_empty()
        };
        self.queue.reset();
        debug!(token = self.token.0, pipelined, "Keep-alive reset");

        if let Err(e) = self.arm_read() {
            debug!(token = self.token.0, "Failed to re-arm reads: {}", e);
            self.close();
            return;
        }
        // Carried bytes and plaintext buffered by TLS produce no readiness
        // event, so the reactor picks them up from a timer.
        let conn = self.clone();
        self.reactor
            .register_timer(Duration::ZERO, Arc::new(move |_: &Reactor| conn.resume()));
    }

    fn resume(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        match self.ingest(&[]) {
            Step::Continue => self.on_readable(),
            Step::Reject(status) => self.reject(status),
            Step::Dispatch(job) => self.dispatch(job),
        }
    }

    fn on_writable(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        match self.write_out() {
            Ok(false) => {}
            Ok(true) => {
                let _ = self.reactor.unregister_write(self.token);
                let waiter = lock(&self.output).waiter.take();
                match waiter {
                    Some(DrainWaiter::Worker(tx)) => {
                        let _ = tx.send(Ok(()));
                    }
                    Some(DrainWaiter::Close) => self.close(),
                    None => {}
                }
            }
            Err(e) => {
                warn!(token = self.token.0, peer = %self.peer_addr, "Write failed: {}", e);
                self.close();
            }
        }
    }

    /// Writes queued segments until the socket blocks. Returns `true` once
    /// everything, including buffered TLS records, has been written.
    fn write_out(&self) -> io::Result<bool> {
        let mut output = lock(&self.output);
        let mut io = lock(&self.io);
        let transport = io
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;

        loop {
            if let Some(tls) = transport.tls.as_mut() {
                if !tls.flush_pending(&mut transport.stream).map_err(io::Error::other)? {
                    return Ok(false);
                }
            }

            let segment = match output.in_flight.take().or_else(|| self.queue.try_pop()) {
                Some(segment) => segment,
                None => return Ok(true),
            };

            if let Some(tls) = transport.tls.as_mut() {
                tls.write(&mut transport.stream, &segment)
                    .map_err(io::Error::other)?;
                continue;
            }

            match transport.stream.write(&segment) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) if n < segment.len() => output.in_flight = Some(segment.slice(n..)),
                Ok(n) => trace!(token = self.token.0, bytes = n, "Wrote response bytes"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    output.in_flight = Some(segment);
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => output.in_flight = Some(segment),
                Err(e) => return Err(e),
            }
        }
    }

    /// Tears the connection down. Safe from any thread; later calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reactor.forget(self.token);

        let waiter = lock(&self.output).waiter.take();
        if let Some(DrainWaiter::Worker(tx)) = waiter {
            let _ = tx.send(Err(io::ErrorKind::BrokenPipe.into()));
        }

        let transport = lock(&self.io).take();
        if let Some(mut transport) = transport {
            if let Some(tls) = transport.tls.as_mut() {
                tls.shutdown(&mut transport.stream);
            }
            let _ = transport.stream.shutdown(Shutdown::Both);
        }
        self.queue.stop();
        debug!(token = self.token.0, peer = %self.peer_addr, "Connection closed");
    }
}

impl FlushTarget for Connection {
    fn drain(&self, _queue: &Arc<BufferQueue>) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut output = lock(&self.output);
            if output.waiter.is_some() {
                return Err(io::Error::other("flush already in flight"));
            }
            output.waiter = Some(DrainWaiter::Worker(tx));
        }

        if let Err(e) = self.arm_write() {
            lock(&self.output).waiter = None;
            return Err(e);
        }
        rx.blocking_recv()
            .unwrap_or_else(|_| Err(io::ErrorKind::BrokenPipe.into()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!(token = self.token.0, "Connection dropped");
    }
}
