//! Session pool keyed by worker identity.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use super::channel::ChannelSession;

/// Identity of a worker owning at most one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(String);

impl WorkerId {
    /// Create a worker identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity of the calling OS thread.
    pub fn current_thread() -> Self {
        let thread = std::thread::current();
        match thread.name() {
            Some(name) => Self(format!("{}-{:?}", name, thread.id())),
            None => Self(format!("{:?}", thread.id())),
        }
    }

    /// String form of the identity.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Open sessions, at most one per worker.
///
/// Sessions are handed out as `Arc`s but only ever used by their owning
/// worker; the pool only decides which session a worker gets.
#[derive(Default)]
pub struct SessionPool {
    sessions: DashMap<WorkerId, Arc<ChannelSession>>,
}

impl SessionPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// The worker's session, if it is still open.
    ///
    /// A session that closed since it was pooled is evicted and discarded.
    pub fn get(&self, worker: &WorkerId) -> Option<Arc<ChannelSession>> {
        let session = self.sessions.get(worker).map(|entry| entry.value().clone())?;
        if session.is_open() {
            return Some(session);
        }
        self.discard(&session);
        None
    }

    /// Bind a session to its worker, returning the session it replaced.
    ///
    /// The replaced session is discarded and its channel closed.
    pub async fn insert(&self, session: Arc<ChannelSession>) -> Option<Arc<ChannelSession>> {
        let previous = self
            .sessions
            .insert(session.worker().clone(), session.clone())?;
        if Arc::ptr_eq(&previous, &session) {
            return Some(previous);
        }
        if let Err(err) = previous.close().await {
            tracing::warn!(
                "closing replaced channel {} for worker {} failed: {}",
                previous.channel_id(),
                previous.worker(),
                err
            );
        }
        Some(previous)
    }

    /// Mark a session discarded and unbind it from its worker.
    ///
    /// Only removes the pooled entry if it is this exact session, so a stale
    /// handle cannot evict its replacement.
    pub fn discard(&self, session: &Arc<ChannelSession>) {
        session.discard();
        self.sessions
            .remove_if(session.worker(), |_, pooled| Arc::ptr_eq(pooled, session));
    }

    /// Open sessions across all workers.
    pub fn live_sessions(&self) -> Vec<Arc<ChannelSession>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_open())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Remove and return every pooled session.
    pub fn drain(&self) -> Vec<Arc<ChannelSession>> {
        let workers: Vec<WorkerId> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        workers
            .into_iter()
            .filter_map(|worker| self.sessions.remove(&worker).map(|(_, session)| session))
            .collect()
    }

    /// Number of pooled sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is pooled.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
