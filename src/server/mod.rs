//! Server assembly: binds the listening socket, owns the context table and
//! runs the reactor.

pub mod listener;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use mio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::http::connection::Shared;
use crate::http::context::{ContextOptions, HttpContext, Router};
use crate::http::encoding::EncodingRegistry;
use crate::http::session::SessionTable;
use crate::reactor::Reactor;
use crate::tls::load_server_config;

use listener::Listener;

pub struct Server {
    config: Config,
    reactor: Reactor,
    socket: TcpListener,
    router: Router,
    encodings: EncodingRegistry,
    sessions: Arc<SessionTable>,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl Server {
    /// Binds the configured address and loads TLS material, if any.
    /// Nothing is served until [`Server::run`].
    pub fn bind(config: Config) -> anyhow::Result<Self> {
        let addr: SocketAddr = config
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {:?}", config.listen_addr))?;
        let socket = TcpListener::bind(addr).with_context(|| format!("failed to bind {}", addr))?;
        let reactor = Reactor::new(config.worker_threads, config.max_pending_work)
            .context("failed to start reactor")?;
        let tls = config.tls.as_ref().map(load_server_config).transpose()?;
        let sessions = SessionTable::new(reactor.clone(), config.session_timeout());

        Ok(Self {
            config,
            reactor,
            socket,
            router: Router::new(),
            encodings: EncodingRegistry::default(),
            sessions,
            tls,
        })
    }

    /// Mounts `context` at the exact path `path`. A later mount replaces an
    /// earlier one.
    pub fn add_context(
        &mut self,
        path: impl Into<String>,
        context: Arc<dyn HttpContext>,
        options: ContextOptions,
    ) -> &mut Self {
        self.router.add(path, context, options);
        self
    }

    pub fn encodings_mut(&mut self) -> &mut EncodingRegistry {
        &mut self.encodings
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    pub fn sessions(&self) -> Arc<SessionTable> {
        self.sessions.clone()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            reactor: self.reactor.clone(),
        }
    }

    /// Serves on the calling thread until [`ServerHandle::stop`].
    pub fn run(self) -> anyhow::Result<()> {
        let Server {
            config,
            reactor,
            socket,
            router,
            encodings,
            sessions,
            tls,
        } = self;
        info!(
            contexts = router.len(),
            workers = config.worker_threads,
            secure = tls.is_some(),
            "Starting server"
        );
        let shared = Arc::new(Shared {
            router,
            sessions,
            encodings,
            config,
            tls,
        });

        let _listener = Listener::start(socket, &reactor, shared)?;
        reactor.run()?;
        info!("Server stopped");
        Ok(())
    }
}

/// Stops a running [`Server`] from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    reactor: Reactor,
}

impl ServerHandle {
    /// Stops accepting and gives in-flight handlers up to `grace` to finish.
    pub fn stop(&self, grace: Duration) {
        info!("Stopping server");
        self.reactor.stop(grace);
    }

    pub fn is_running(&self) -> bool {
        self.reactor.is_running()
    }
}
