//! Readiness-driven event loop.
//!
//! One thread runs [`Reactor::run`] and owns the selector. Sockets are
//! attached to a registration table holding at most one read and one write
//! callback each; the armed OS interest always matches the installed
//! callbacks. Completed requests are handed to a bounded [`WorkerPool`].
//!
//! All table, timer and backlog mutation goes through one mutex so workers
//! can flip interests while the loop dispatches. Callbacks are snapshotted
//! under that lock and invoked outside it.

pub mod event_loop;
pub mod pool;
pub mod timer;

pub use event_loop::{Callback, Reactor};
pub use pool::{Task, WorkerPool};
pub use timer::{TimerHeap, TimerId};
