use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use mio::Token;
use mio::net::TcpListener;
use tracing::{error, info, warn};

use crate::http::connection::{Connection, Shared};
use crate::reactor::Reactor;

/// Listening socket driven by the reactor's read interest.
pub(crate) struct Listener {
    socket: TcpListener,
    token: Token,
}

impl Listener {
    /// Registers the socket so that every readiness event accepts whatever
    /// connections are pending.
    pub(crate) fn start(socket: TcpListener, reactor: &Reactor, shared: Arc<Shared>) -> io::Result<Arc<Self>> {
        let token = reactor.attach(socket.as_raw_fd());
        let listener = Arc::new(Listener { socket, token });

        let accepting = listener.clone();
        reactor.register_read(
            token,
            Arc::new(move |reactor: &Reactor| accepting.accept_all(reactor, &shared)),
        )?;
        info!("Listening on {}", listener.socket.local_addr()?);
        Ok(listener)
    }

    fn accept_all(&self, reactor: &Reactor, shared: &Arc<Shared>) {
        loop {
            match self.socket.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = Connection::open(stream, peer, reactor.clone(), shared.clone()) {
                        warn!(peer = %peer, "Failed to set up connection: {}", e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(token = self.token.0, "Accept failed: {}", e);
                    return;
                }
            }
        }
    }
}
