//! nbhttp - non-blocking HTTP/1.1 and HTTPS server
//!
//! A single reactor thread owns every socket; handlers run on a bounded
//! worker pool and stream responses back through back-pressured queues.

pub mod config;
pub mod http;
pub mod reactor;
pub mod server;
pub mod tls;
