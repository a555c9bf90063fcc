use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::reactor::{Reactor, TimerId};

/// Cookie carrying the session id.
pub const SESSION_COOKIE: &str = "ISSESSIONID";

pub struct Session {
    id: String,
    created: Instant,
    last_access: Mutex<Instant>,
    attributes: Mutex<HashMap<String, String>>,
    timer: Mutex<Option<TimerId>>,
}

impl Session {
    fn new(id: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            created: now,
            last_access: Mutex::new(now),
            attributes: Mutex::new(HashMap::new()),
            timer: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn last_access(&self) -> Instant {
        *lock(&self.last_access)
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        lock(&self.attributes).get(name).cloned()
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: impl Into<String>) {
        lock(&self.attributes).insert(name.into(), value.into());
    }

    pub fn remove_attribute(&self, name: &str) -> Option<String> {
        lock(&self.attributes).remove(name)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Live sessions by id, each expiring after `timeout` without access.
///
/// Every session owns a reactor timer that is pushed back on each access;
/// when it fires the session is dropped from the table.
pub struct SessionTable {
    reactor: Reactor,
    timeout: Duration,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionTable {
    pub fn new(reactor: Reactor, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            reactor,
            timeout,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn create(self: &Arc<Self>) -> Arc<Session> {
        let session = Arc::new(Session::new(new_session_id()));
        lock(&self.sessions).insert(session.id.clone(), session.clone());

        let table: Weak<Self> = Arc::downgrade(self);
        let id = session.id.clone();
        let timer = self.reactor.register_timer(
            self.timeout,
            Arc::new(move |_: &Reactor| {
                if let Some(table) = table.upgrade() {
                    table.expire(&id);
                }
            }),
        );
        *lock(&session.timer) = Some(timer);

        debug!(session = %session.id, "Session created");
        session
    }

    /// Returns a live session and restarts its expiry timer.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = lock(&self.sessions).get(id).cloned()?;
        *lock(&session.last_access) = Instant::now();
        if let Some(timer) = *lock(&session.timer) {
            self.reactor.update_timer(timer, self.timeout);
        }
        Some(session)
    }

    /// Removes a session ahead of its expiry. Returns `false` if unknown.
    pub fn invalidate(&self, id: &str) -> bool {
        let Some(session) = lock(&self.sessions).remove(id) else {
            return false;
        };
        if let Some(timer) = lock(&session.timer).take() {
            self.reactor.cancel_timer(timer);
        }
        true
    }

    fn expire(&self, id: &str) {
        if lock(&self.sessions).remove(id).is_some() {
            debug!(session = %id, "Session expired");
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 128 random bits as upper-case hex.
fn new_session_id() -> String {
    rand::random::<[u8; 16]>()
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect()
}
