use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, trace, warn};

use super::pool::{Task, WorkerPool};
use super::timer::{TimerHeap, TimerId};

/// Readiness or timer callback. Runs on the reactor thread.
pub type Callback = Arc<dyn Fn(&Reactor) + Send + Sync>;

const WAKE_TOKEN: Token = Token(usize::MAX);

/// How long the loop sleeps at most while rejected work waits for the pool.
const BACKLOG_RETRY: Duration = Duration::from_millis(10);

struct Registration {
    fd: RawFd,
    read: Option<Callback>,
    write: Option<Callback>,
    armed: Option<Interest>,
}

impl Registration {
    fn wanted(&self) -> Option<Interest> {
        match (self.read.is_some(), self.write.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Brings the OS interest set in line with the installed callbacks.
    ///
    /// With `rearm` set an unchanged interest set is modified anyway, which
    /// makes the selector report current readiness again.
    fn sync(&mut self, registry: &Registry, token: Token, rearm: bool) -> io::Result<()> {
        let wanted = self.wanted();
        let mut source = SourceFd(&self.fd);
        match (self.armed, wanted) {
            (None, Some(interest)) => registry.register(&mut source, token, interest)?,
            (Some(armed), Some(interest)) if armed != interest || rearm => {
                registry.reregister(&mut source, token, interest)?
            }
            (Some(_), None) => registry.deregister(&mut source)?,
            _ => {}
        }
        self.armed = wanted;
        Ok(())
    }
}

/// State shared between the reactor thread and the workers.
struct Gate {
    registrations: HashMap<Token, Registration>,
    timers: TimerHeap<Callback>,
    backlog: VecDeque<Task>,
}

struct Inner {
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    running: AtomicBool,
    gate: Mutex<Gate>,
    pool: WorkerPool,
    next_token: AtomicUsize,
}

/// Single-threaded readiness loop with timers and a bounded worker pool.
///
/// `Reactor` is a cheap handle; clones drive the same loop. Registration
/// calls are safe from any thread, `run` is meant for exactly one.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

impl Reactor {
    pub fn new(worker_threads: usize, max_pending_work: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let pool = WorkerPool::new(worker_threads, max_pending_work)?;

        Ok(Self {
            inner: Arc::new(Inner {
                poll: Mutex::new(poll),
                registry,
                waker,
                running: AtomicBool::new(true),
                gate: Mutex::new(Gate {
                    registrations: HashMap::new(),
                    timers: TimerHeap::new(),
                    backlog: VecDeque::new(),
                }),
                pool,
                next_token: AtomicUsize::new(0),
            }),
        })
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.inner.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a socket to the registration table with no interest armed.
    pub fn attach(&self, fd: RawFd) -> Token {
        let token = Token(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        self.gate().registrations.insert(
            token,
            Registration {
                fd,
                read: None,
                write: None,
                armed: None,
            },
        );
        token
    }

    /// Drops the registration for `token`, disarming any interest.
    pub fn forget(&self, token: Token) {
        let removed = self.gate().registrations.remove(&token);
        if let Some(reg) = removed {
            if reg.armed.is_some() {
                let _ = self.inner.registry.deregister(&mut SourceFd(&reg.fd));
            }
        }
    }

    pub fn register_read(&self, token: Token, callback: Callback) -> io::Result<Option<Callback>> {
        self.install(token, callback, |reg| &mut reg.read)
    }

    pub fn register_write(&self, token: Token, callback: Callback) -> io::Result<Option<Callback>> {
        self.install(token, callback, |reg| &mut reg.write)
    }

    pub fn unregister_read(&self, token: Token) -> io::Result<()> {
        self.clear(token, |reg| &mut reg.read)
    }

    pub fn unregister_write(&self, token: Token) -> io::Result<()> {
        self.clear(token, |reg| &mut reg.write)
    }

    fn install(
        &self,
        token: Token,
        callback: Callback,
        slot: fn(&mut Registration) -> &mut Option<Callback>,
    ) -> io::Result<Option<Callback>> {
        let mut gate = self.gate();
        let reg = gate
            .registrations
            .get_mut(&token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket not attached"))?;
        let previous = slot(reg).replace(callback);
        if let Err(e) = reg.sync(&self.inner.registry, token, true) {
            *slot(reg) = previous;
            return Err(e);
        }
        Ok(previous)
    }

    fn clear(&self, token: Token, slot: fn(&mut Registration) -> &mut Option<Callback>) -> io::Result<()> {
        let mut gate = self.gate();
        match gate.registrations.get_mut(&token) {
            Some(reg) => {
                let Some(callback) = slot(reg).take() else {
                    return Ok(());
                };
                if let Err(e) = reg.sync(&self.inner.registry, token, false) {
                    *slot(reg) = Some(callback);
                    return Err(e);
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Schedules `callback` to run on the reactor thread after `delay`.
    pub fn register_timer(&self, delay: Duration, callback: Callback) -> TimerId {
        let id = self.gate().timers.insert(Instant::now() + delay, callback);
        self.wake();
        id
    }

    /// Cancels a timer. Returns `false` when it already fired or was cancelled.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.gate().timers.cancel(id)
    }

    /// Re-arms a pending timer to fire `delay` from now.
    pub fn update_timer(&self, id: TimerId, delay: Duration) -> bool {
        let updated = self.gate().timers.reschedule(id, Instant::now() + delay);
        if updated {
            self.wake();
        }
        updated
    }

    /// Hands `task` to the worker pool, queueing it if the pool is saturated.
    pub fn submit_work(&self, task: Task) {
        let mut gate = self.gate();
        if !gate.backlog.is_empty() {
            gate.backlog.push_back(task);
            return;
        }
        if let Err(task) = self.inner.pool.try_submit(task) {
            trace!("Worker pool saturated, queueing task");
            gate.backlog.push_back(task);
            drop(gate);
            self.wake();
        }
    }

    fn drain_backlog(&self) {
        let mut gate = self.gate();
        while let Some(task) = gate.backlog.pop_front() {
            if let Err(task) = self.inner.pool.try_submit(task) {
                gate.backlog.push_front(task);
                break;
            }
        }
    }

    pub fn wake(&self) {
        if let Err(e) = self.inner.waker.wake() {
            warn!("Failed to wake reactor: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Runs the loop on the calling thread until `stop` is called.
    pub fn run(&self) -> io::Result<()> {
        let mut poll = self.inner.poll.lock().unwrap_or_else(|e| e.into_inner());
        let mut events = Events::with_capacity(1024);

        while self.is_running() {
            let timeout = {
                let mut gate = self.gate();
                let timer = gate
                    .timers
                    .next_deadline()
                    .map(|at| at.saturating_duration_since(Instant::now()));
                if gate.backlog.is_empty() {
                    timer
                } else {
                    Some(timer.map_or(BACKLOG_RETRY, |t| t.min(BACKLOG_RETRY)))
                }
            };

            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }
            if !self.is_running() {
                break;
            }

            let expired = self.gate().timers.pop_expired(Instant::now());
            for callback in expired {
                callback(self);
            }

            self.drain_backlog();

            let ready: Vec<Callback> = {
                let gate = self.gate();
                let mut ready = Vec::new();
                for event in events.iter() {
                    if event.token() == WAKE_TOKEN {
                        continue;
                    }
                    let Some(reg) = gate.registrations.get(&event.token()) else {
                        trace!(token = event.token().0, "Event for stale token");
                        continue;
                    };
                    let failed = event.is_error();
                    if event.is_readable() || event.is_read_closed() || failed {
                        if let Some(cb) = &reg.read {
                            ready.push(cb.clone());
                        }
                    }
                    if event.is_writable() || event.is_write_closed() || failed {
                        if let Some(cb) = &reg.write {
                            ready.push(cb.clone());
                        }
                    }
                }
                ready
            };

            for callback in ready {
                callback(self);
            }
        }

        let mut gate = self.gate();
        debug!(
            connections = gate.registrations.len(),
            timers = gate.timers.len(),
            "Reactor loop exited"
        );
        for reg in gate.registrations.values() {
            if reg.armed.is_some() {
                let _ = self.inner.registry.deregister(&mut SourceFd(&reg.fd));
            }
        }
        gate.registrations.clear();
        gate.timers.clear();
        gate.backlog.clear();
        Ok(())
    }

    /// Stops the loop and waits up to `deadline` for in-flight work.
    ///
    /// Must be called from outside the worker pool.
    pub fn stop(&self, deadline: Duration) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.wake();
        self.inner.pool.shutdown(deadline);
        self.gate().timers.clear();
    }
}
