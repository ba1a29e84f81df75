//! In-process session store, shared by all workers.

use crate::id::SessionId;
use crate::jar::CookieJar;
use bytes::Bytes;
use dashmap::DashMap;
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub realm: String,
    pub site: Option<String>,

    pub user: Option<String>,
    pub user_expires: Option<SystemTime>,

    pub language: Option<String>,
    /// Opaque blob the translation server associates with the session.
    pub translate: Option<Bytes>,

    pub cookie_sent: bool,
    pub cookie_received: bool,
    pub is_new: bool,

    pub cookies: CookieJar,

    pub external_manager: Option<String>,
    pub external_keepalive: Duration,
    pub next_external_keepalive: Instant,

    last_used: Instant,
}

impl Session {
    fn new(id: SessionId, realm: String) -> Self {
        Session {
            id,
            realm,
            site: None,
            user: None,
            user_expires: None,
            language: None,
            translate: None,
            cookie_sent: false,
            cookie_received: false,
            is_new: true,
            cookies: CookieJar::new(),
            external_manager: None,
            external_keepalive: Duration::ZERO,
            next_external_keepalive: Instant::now(),
            last_used: Instant::now(),
        }
    }

    pub fn set_user(&mut self, user: &str, max_age: Option<u32>) {
        self.user = Some(user.to_string());
        self.user_expires = max_age
            .filter(|&age| age > 0)
            .map(|age| SystemTime::now() + Duration::from_secs(age as u64));
    }

    pub fn clear_user(&mut self) {
        self.user = None;
        self.user_expires = None;
    }

    /// The user, unless their login has expired.
    pub fn valid_user(&mut self) -> Option<&str> {
        if let Some(expires) = self.user_expires {
            if expires <= SystemTime::now() {
                tracing::debug!(user = ?self.user, "session user has expired");
                self.clear_user();
            }
        }
        self.user.as_deref()
    }
}

/// Keyed session store with idle expiry.  Lives in an `Arc` shared by
/// every worker; access goes through short closure-scoped leases so no
/// lock is ever held across an await point.
pub struct SessionManager {
    sessions: DashMap<u64, Session>,
    idle_expiry: Duration,
}

impl SessionManager {
    pub fn new(idle_expiry: Duration) -> Self {
        SessionManager {
            sessions: DashMap::new(),
            idle_expiry,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Create a session for the realm.
    pub fn create(&self, realm: &str) -> SessionId {
        let id = SessionId::generate();
        self.sessions
            .insert(id.raw(), Session::new(id, realm.to_string()));
        id
    }

    /// Lease the session for the duration of the closure.  Refreshes
    /// the idle timer; returns `None` for unknown or expired ids.
    pub fn with_session<R>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut entry = self.sessions.get_mut(&id.raw())?;
        if entry.last_used.elapsed() > self.idle_expiry {
            drop(entry);
            self.sessions.remove(&id.raw());
            return None;
        }
        entry.last_used = Instant::now();
        Some(f(&mut entry))
    }

    pub fn exists(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id.raw())
    }

    pub fn delete(&self, id: SessionId) {
        self.sessions.remove(&id.raw());
    }

    /// Drop expired sessions; returns how many were removed.
    pub fn purge(&self) -> u32 {
        let mut removed = 0;
        self.sessions.retain(|_, s| {
            let keep = s.last_used.elapsed() <= self.idle_expiry;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }
}
