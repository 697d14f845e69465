//! Cookie-addressable session store with periodic expiry sweep

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::RngCore;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::SessionConfig;
use crate::http::{Cookie, Request, Response};

/// Interval of the expiry sweep
pub const SESSION_SWEEP_INTERVAL_MS: u64 = 60_000;

#[derive(Debug)]
struct SessionInner {
    id: String,
    values: Mutex<HashMap<String, String>>,
    last_access: Mutex<Instant>,
}

/// One client session, shared across requests via its cookie.
///
/// Cloning yields another handle to the same session.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        let id = bytes.iter().map(|b| format!("{b:02x}")).collect();

        Self {
            inner: Arc::new(SessionInner {
                id,
                values: Mutex::new(HashMap::new()),
                last_access: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Session identifier as stored in the cookie
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Store a value under `key`
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .values
            .lock()
            .expect("session values lock poisoned")
            .insert(key.into(), value.into());
    }

    /// Value stored under `key`, if any
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner
            .values
            .lock()
            .expect("session values lock poisoned")
            .get(key)
            .cloned()
    }

    /// Remove the value stored under `key`
    pub fn remove(&self, key: &str) {
        self.inner
            .values
            .lock()
            .expect("session values lock poisoned")
            .remove(key);
    }

    fn touch(&self) {
        *self
            .inner
            .last_access
            .lock()
            .expect("session access lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.inner
            .last_access
            .lock()
            .expect("session access lock poisoned")
            .elapsed()
    }
}

/// Store of sessions addressed by a session cookie.
///
/// Sessions expire once they have not been touched for the configured
/// lifetime; a background sweep removes them every minute.
pub struct SessionStore {
    config: SessionConfig,
    sessions: DashMap<String, Session>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStore {
    /// Create a store and start its expiry sweep
    #[must_use]
    pub fn new(config: SessionConfig) -> Arc<Self> {
        debug!(
            "sessions expire after {} milliseconds",
            config.expiration_time
        );

        let store = Arc::new(Self {
            config,
            sessions: DashMap::new(),
            sweep: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&store);
        let sweep = tokio::spawn(async move {
            let interval = Duration::from_millis(SESSION_SWEEP_INTERVAL_MS);
            loop {
                tokio::time::sleep(interval).await;
                match weak.upgrade() {
                    Some(store) => store.sweep_expired(),
                    None => break,
                }
            }
        });
        *store.sweep.lock().expect("sweep slot lock poisoned") = Some(sweep);

        store
    }

    /// Resolve the session ID for a request.
    ///
    /// A cookie already set on the response wins over the request cookie,
    /// because that is the ID the client will present next. IDs unknown to
    /// the store are discarded.
    #[must_use]
    pub fn session_id(&self, request: &Request, response: &Response) -> Option<String> {
        let id = response
            .cookie(&self.config.cookie_name)
            .or_else(|| request.cookie(&self.config.cookie_name).map(str::to_string))?;

        if self.sessions.contains_key(&id) {
            Some(id)
        } else {
            debug!("received invalid session cookie with ID {id}");
            None
        }
    }

    /// Look up the request's session, optionally creating one.
    ///
    /// A found or created session gets its cookie refreshed on the response
    /// and its last-access time updated.
    #[must_use]
    pub fn session(
        &self,
        request: &Request,
        response: &Response,
        allow_create: bool,
    ) -> Option<Session> {
        if let Some(id) = self.session_id(request, response) {
            let session = self.sessions.get(&id).map(|entry| entry.value().clone());
            if let Some(session) = session {
                self.refresh_cookie(response, &session);
                session.touch();
                return Some(session);
            }
        }

        if allow_create {
            let session = Session::generate();
            debug!("created new session with ID {}", session.id());
            self.sessions
                .insert(session.id().to_string(), session.clone());
            self.refresh_cookie(response, &session);
            return Some(session);
        }

        None
    }

    /// Look up a session directly by its ID
    #[must_use]
    pub fn session_by_id(&self, id: &str) -> Option<Session> {
        let session = self.sessions.get(id).map(|entry| entry.value().clone());
        if let Some(session) = &session {
            session.touch();
        }
        session
    }

    /// Delete a session
    pub fn remove_session(&self, session: &Session) {
        self.sessions.remove(session.id());
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store holds no sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn refresh_cookie(&self, response: &Response, session: &Session) {
        let mut cookie = Cookie::new(self.config.cookie_name.clone(), session.id())
            .with_max_age(self.config.expiration_time / 1000);
        if !self.config.cookie_path.is_empty() {
            cookie = cookie.with_path(self.config.cookie_path.clone());
        }
        if !self.config.cookie_comment.is_empty() {
            cookie = cookie.with_comment(self.config.cookie_comment.clone());
        }
        if !self.config.cookie_domain.is_empty() {
            cookie = cookie.with_domain(self.config.cookie_domain.clone());
        }
        response.set_cookie(cookie);
    }

    /// Remove sessions idle longer than the configured lifetime
    pub fn sweep_expired(&self) {
        let lifetime = Duration::from_millis(self.config.expiration_time);
        self.sessions.retain(|id, session| {
            if session.idle_for() > lifetime {
                debug!("session {id} expired");
                false
            } else {
                true
            }
        });
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        if let Some(sweep) = self.sweep.lock().expect("sweep slot lock poisoned").take() {
            sweep.abort();
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.len())
            .field("cookie_name", &self.config.cookie_name)
            .finish()
    }
}
