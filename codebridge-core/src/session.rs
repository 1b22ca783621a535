// ABOUTME: Session registry - maps (user, channel, thread) to a backend continuation token.
// ABOUTME: Synchronous map operations behind one mutex, plus a periodic idle reclaimer task.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Thread value used when a conversation has no thread
pub const DIRECT_THREAD: &str = "direct";

/// Identity of one conversation. An absent or empty thread is the same
/// conversation as `direct`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    user: String,
    channel: String,
    thread: String,
}

impl SessionKey {
    pub fn new(user: impl Into<String>, channel: impl Into<String>, thread: Option<&str>) -> Self {
        let thread = match thread.map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => DIRECT_THREAD.to_string(),
        };
        Self {
            user: user.into(),
            channel: channel.into(),
            thread,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn thread(&self) -> &str {
        &self.thread
    }

    pub fn is_direct(&self) -> bool {
        self.thread == DIRECT_THREAD
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.user, self.channel, self.thread)
    }
}

#[derive(Debug)]
struct SessionState {
    continuation_token: Option<String>,
    active: bool,
    last_activity: Instant,
}

/// Shared handle to one registry entry. Clones refer to the same session.
#[derive(Debug, Clone)]
pub struct Session {
    key: SessionKey,
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    fn new(key: SessionKey) -> Self {
        Self {
            key,
            state: Arc::new(Mutex::new(SessionState {
                continuation_token: None,
                active: true,
                last_activity: Instant::now(),
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn continuation_token(&self) -> Option<String> {
        self.state().continuation_token.clone()
    }

    /// Record the token announced by the backend; also counts as activity
    pub fn set_continuation_token(&self, token: impl Into<String>) {
        let mut state = self.state();
        state.continuation_token = Some(token.into());
        state.last_activity = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state().active
    }

    pub fn last_activity(&self) -> Instant {
        self.state().last_activity
    }

    pub fn touch(&self) {
        self.state().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.state().last_activity.elapsed()
    }

    fn deactivate(&self) {
        self.state().active = false;
    }
}

/// All live sessions. No method awaits or holds the lock across a call out.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &SessionKey) -> Option<Session> {
        self.sessions().get(key).cloned()
    }

    /// Fresh session with no token, replacing any existing entry for `key`
    pub fn create(&self, key: SessionKey) -> Session {
        let session = Session::new(key.clone());
        if let Some(old) = self.sessions().insert(key.clone(), session.clone()) {
            old.deactivate();
            tracing::debug!(session = %key, "Replaced existing session");
        }
        tracing::debug!(session = %key, "Created session");
        session
    }

    pub fn get_or_create(&self, key: SessionKey) -> Session {
        let mut sessions = self.sessions();
        if let Some(existing) = sessions.get(&key) {
            return existing.clone();
        }
        let session = Session::new(key.clone());
        sessions.insert(key.clone(), session.clone());
        tracing::debug!(session = %key, "Created session");
        session
    }

    pub fn remove(&self, key: &SessionKey) -> Option<Session> {
        let removed = self.sessions().remove(key);
        if let Some(ref session) = removed {
            session.deactivate();
        }
        removed
    }

    /// Remove every session idle longer than `max_idle`; returns how many went
    pub fn reclaim(&self, max_idle: Duration) -> usize {
        self.take_idle(max_idle).len()
    }

    /// Like [`reclaim`](Self::reclaim), handing back the removed sessions
    pub fn take_idle(&self, max_idle: Duration) -> Vec<Session> {
        let now = Instant::now();
        let mut removed = Vec::new();
        self.sessions().retain(|key, session| {
            let idle = now.saturating_duration_since(session.last_activity());
            if idle > max_idle {
                tracing::debug!(session = %key, idle_secs = idle.as_secs(), "Reclaiming idle session");
                session.deactivate();
                removed.push(session.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Cleaned up inactive sessions");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        self.sessions().keys().cloned().collect()
    }
}

/// Reclaim idle sessions every `interval` until `cancel` fires.
/// `on_reclaim` runs for each removed session, outside the registry lock.
pub fn spawn_reclaimer<F>(
    registry: Arc<SessionRegistry>,
    max_idle: Duration,
    interval: Duration,
    cancel: CancellationToken,
    on_reclaim: F,
) -> JoinHandle<()>
where
    F: Fn(&Session) + Send + 'static,
{
    tracing::info!(
        max_idle_secs = max_idle.as_secs(),
        interval_secs = interval.as_secs(),
        "Starting session reclaimer"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Session reclaimer stopped");
                    break;
                }
                _ = ticker.tick() => {
                    for session in registry.take_idle(max_idle) {
                        on_reclaim(&session);
                    }
                }
            }
        }
    })
}
