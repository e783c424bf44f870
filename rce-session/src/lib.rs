#![deny(missing_docs)]
//! The Session Manager: TTL- and capacity-bounded interpreter session state.
//!
//! A [`Session`] holds the Rhai variable snapshot a caller builds up across
//! repeated interpreter calls within one logical conversation. Sessions are
//! looked up and created through [`SessionManager::get_or_create`], which
//! returns a handle whose `Mutex` serializes access — two callers racing the
//! same session id never execute concurrently, while distinct sessions never
//! block each other. Idle sessions are reclaimed by LRU capacity eviction and
//! by an explicit, periodically-invoked TTL [`SessionManager::sweep`].

use lru::LruCache;
use rce_core::SessionId;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// One session's interpreter-variable state.
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Variables carried over between interpreter calls in this session.
    pub variables: serde_json::Map<String, serde_json::Value>,
    created_at: Option<Instant>,
    last_used: Option<Instant>,
}

impl Session {
    fn touch(&mut self) {
        let now = Instant::now();
        self.created_at.get_or_insert(now);
        self.last_used = Some(now);
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        match self.last_used {
            Some(last_used) => last_used.elapsed() >= ttl,
            None => false,
        }
    }
}

/// A shared, lock-serialized handle to one session's state.
pub type SessionHandle = Arc<Mutex<Session>>;

/// Manages the pool of live sessions.
///
/// Capacity eviction is handled inline by the underlying `lru::LruCache` on
/// every `get_or_create`; TTL eviction is handled by [`sweep`](Self::sweep),
/// which callers are expected to invoke on a timer (the engine facade wires
/// this to a `tokio::time::interval` in its runtime loop).
pub struct SessionManager {
    sessions: Mutex<LruCache<SessionId, SessionHandle>>,
    ttl: Duration,
}

impl SessionManager {
    /// Build a manager with the given capacity (LRU-evicted) and TTL (swept).
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            sessions: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Fetch the session for `id`, creating a fresh one if it doesn't exist.
    ///
    /// Touches the session's recency for both the TTL clock and the LRU
    /// ordering, so a session that's merely read stays alive.
    pub async fn get_or_create(&self, id: &SessionId) -> SessionHandle {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(id) {
            let handle = handle.clone();
            handle.lock().await.touch();
            return handle;
        }
        let handle: SessionHandle = Arc::new(Mutex::new(Session::default()));
        handle.lock().await.touch();
        sessions.put(id.clone(), handle.clone());
        handle
    }

    /// Remove a session outright. Returns `true` if it existed.
    pub async fn destroy(&self, id: &SessionId) -> bool {
        self.sessions.lock().await.pop(id).is_some()
    }

    /// List the ids of all currently live sessions, most-recently-used first.
    pub async fn list(&self) -> Vec<SessionId> {
        self.sessions.lock().await.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Evict every session whose TTL has elapsed since its last use.
    ///
    /// Returns the number of sessions removed. Safe to call on any cadence;
    /// a session touched again after being swept simply starts a new one.
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let mut expired = Vec::new();
        for (id, handle) in sessions.iter() {
            if handle.lock().await.is_expired(self.ttl) {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            sessions.pop(id);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "swept expired interpreter sessions");
        }
        expired.len()
    }

    /// Number of currently live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether no sessions are currently live.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_returns_same_handle_for_repeat_id() {
        let manager = SessionManager::new(4, Duration::from_secs(60));
        let id = SessionId::new("s1");

        let handle_a = manager.get_or_create(&id).await;
        handle_a.lock().await.variables.insert("x".into(), serde_json::json!(1));

        let handle_b = manager.get_or_create(&id).await;
        assert_eq!(
            handle_b.lock().await.variables.get("x"),
            Some(&serde_json::json!(1))
        );
    }

    #[tokio::test]
    async fn distinct_sessions_are_independent() {
        let manager = SessionManager::new(4, Duration::from_secs(60));
        let a = manager.get_or_create(&SessionId::new("a")).await;
        let b = manager.get_or_create(&SessionId::new("b")).await;

        a.lock().await.variables.insert("only_a".into(), serde_json::json!(true));
        assert!(b.lock().await.variables.get("only_a").is_none());
    }

    #[tokio::test]
    async fn destroy_removes_a_session() {
        let manager = SessionManager::new(4, Duration::from_secs(60));
        let id = SessionId::new("gone");
        manager.get_or_create(&id).await;
        assert!(manager.destroy(&id).await);
        assert!(!manager.destroy(&id).await);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let manager = SessionManager::new(2, Duration::from_secs(60));
        manager.get_or_create(&SessionId::new("a")).await;
        manager.get_or_create(&SessionId::new("b")).await;
        manager.get_or_create(&SessionId::new("c")).await;

        let live = manager.list().await;
        assert_eq!(live.len(), 2);
        assert!(!live.iter().any(|id| id.as_str() == "a"));
    }

    #[tokio::test]
    async fn sweep_evicts_only_expired_sessions() {
        let manager = SessionManager::new(4, Duration::from_millis(10));
        manager.get_or_create(&SessionId::new("stale")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.get_or_create(&SessionId::new("fresh")).await;

        let removed = manager.sweep().await;
        assert_eq!(removed, 1);
        let live = manager.list().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].as_str(), "fresh");
    }

    #[tokio::test]
    async fn list_is_empty_initially() {
        let manager = SessionManager::new(4, Duration::from_secs(60));
        assert!(manager.is_empty().await);
        assert_eq!(manager.len().await, 0);
    }
}
