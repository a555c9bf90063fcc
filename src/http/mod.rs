//! HTTP/1.1 on top of the reactor.
//!
//! # Architecture
//!
//! - **`connection`**: per-socket state machine tying the reactor, TLS and workers together
//! - **`parser`**: incremental request-head parser with a bounded buffer
//! - **`buffer`**: segmented byte queue shared by producers and the reactor
//! - **`request`**: request view handed to contexts
//! - **`writer`**: response framing, chunking and compression
//! - **`context`**: handler trait and the path router
//! - **`session`** / **`cookie`**: cookie-keyed sessions with idle expiry
//!
//! # Connection lifecycle
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← reactor thread parses head and body
//!        └──────┬──────┘
//!               │ request complete, reads disarmed
//!               ▼
//!        ┌──────────────────┐
//!        │   Dispatched     │ ← worker runs the context
//!        └──────┬───────────┘
//!               │ flush: worker parks, reactor writes
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │
//!        └──────┬───────────┘
//!               │ finished
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::io::Write;
//! use std::sync::Arc;
//! use nbhttp::config::Config;
//! use nbhttp::http::context::{ContextOptions, FnContext};
//! use nbhttp::http::request::Request;
//! use nbhttp::http::writer::ResponseWriter;
//! use nbhttp::server::Server;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut server = Server::bind(Config::default())?;
//!     let hello = FnContext(|_: &mut Request, resp: &mut ResponseWriter| -> anyhow::Result<()> {
//!         resp.write_all(b"hello\n")?;
//!         Ok(())
//!     });
//!     server.add_context("/", Arc::new(hello), ContextOptions::default());
//!     server.run()
//! }
//! ```

pub mod buffer;
pub mod connection;
pub mod context;
pub mod cookie;
pub mod encoding;
pub mod form;
pub mod parser;
pub mod request;
pub mod response;
pub mod session;
pub mod writer;
