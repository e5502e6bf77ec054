//! Session store.
//!
//! Sessions are keyed by id and handed out as
//! `Arc<tokio::sync::Mutex<Session>>`; the retrieval orchestrator holds the
//! lock for a whole answer, so concurrent questions in one session run one
//! after another in lock order. With a pool attached, turns are also written
//! to `conversation_turns` and reloaded the first time a session id is seen
//! by this process.
//!
//! Handles nobody holds are dropped once they sit idle past the store's
//! idle timeout; [`SessionStore::end`] drops one immediately, persisted
//! turns included.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::debug;

use mmrag_core::models::{ConversationTurn, Role};
use mmrag_core::session::Session;

pub type SessionHandle = Arc<AsyncMutex<Session>>;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

struct Slot {
    handle: SessionHandle,
    last_used: Instant,
}

impl Slot {
    fn new(session: Session) -> Self {
        Self {
            handle: Arc::new(AsyncMutex::new(session)),
            last_used: Instant::now(),
        }
    }
}

pub struct SessionStore {
    sessions: Mutex<HashMap<String, Slot>>,
    pool: Option<SqlitePool>,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn in_memory() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            pool: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn persistent(pool: SqlitePool) -> Self {
        Self {
            pool: Some(pool),
            ..Self::in_memory()
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Start a new empty session and return its id.
    pub fn create(&self) -> String {
        let session = Session::new();
        let id = session.id.clone();
        let mut cache = self.cache();
        self.evict(&mut cache);
        cache.insert(id.clone(), Slot::new(session));
        id
    }

    /// Handle for `id`. Unknown ids start a fresh session under that id.
    pub async fn open(&self, id: &str) -> Result<SessionHandle> {
        {
            let mut cache = self.cache();
            self.evict(&mut cache);
            if let Some(slot) = cache.get_mut(id) {
                slot.last_used = Instant::now();
                return Ok(slot.handle.clone());
            }
        }

        let mut session = Session::with_id(id);
        if let Some(pool) = &self.pool {
            session.turns = load_turns(pool, id).await?;
        }

        // Another task may have opened the same id while we were loading.
        let handle = self
            .cache()
            .entry(id.to_string())
            .or_insert_with(|| Slot::new(session))
            .handle
            .clone();
        Ok(handle)
    }

    /// End a session: wait for any answer in progress, forget it, and
    /// delete its persisted turns. Returns whether the session existed.
    pub async fn end(&self, id: &str) -> Result<bool> {
        let cached = self.cache().get(id).map(|slot| slot.handle.clone());
        let mut existed = false;
        if let Some(handle) = cached {
            let _session = handle.lock().await;
            existed = self.cache().remove(id).is_some();
        }
        if let Some(pool) = &self.pool {
            let deleted = sqlx::query("DELETE FROM conversation_turns WHERE session_id = ?")
                .bind(id)
                .execute(pool)
                .await?
                .rows_affected();
            existed |= deleted > 0;
        }
        Ok(existed)
    }

    /// Drop idle sessions now. Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        let mut cache = self.cache();
        self.evict(&mut cache)
    }

    /// Number of sessions held in memory.
    pub fn len(&self) -> usize {
        self.cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions whose handle is still out (an answer in progress) are kept
    /// however old they are.
    fn evict(&self, cache: &mut HashMap<String, Slot>) -> usize {
        let before = cache.len();
        cache.retain(|_, slot| {
            Arc::strong_count(&slot.handle) > 1 || slot.last_used.elapsed() < self.idle_timeout
        });
        let evicted = before - cache.len();
        if evicted > 0 {
            debug!(evicted, remaining = cache.len(), "idle sessions dropped");
        }
        evicted
    }

    /// Append a question/answer exchange to `session` and persist it.
    ///
    /// The caller holds the session's lock, so turns are written in the
    /// order they were produced.
    pub async fn record_exchange(
        &self,
        session: &mut Session,
        question: &str,
        answer: &str,
        now: i64,
    ) -> Result<()> {
        if let Some(pool) = &self.pool {
            let mut tx = pool.begin().await?;
            for (role, text) in [(Role::User, question), (Role::Assistant, answer)] {
                sqlx::query(
                    "INSERT INTO conversation_turns (session_id, role, text, created_at) VALUES (?, ?, ?, ?)",
                )
                .bind(&session.id)
                .bind(role.as_str())
                .bind(text)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        session.record_exchange(question, answer, now);
        Ok(())
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn load_turns(pool: &SqlitePool, session_id: &str) -> Result<Vec<ConversationTurn>> {
    let rows = sqlx::query(
        "SELECT role, text, created_at FROM conversation_turns WHERE session_id = ? ORDER BY id",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let role: String = row.get("role");
            Ok(ConversationTurn {
                role: Role::from_str(&role).map_err(anyhow::Error::msg)?,
                text: row.get("text"),
                created_at: row.get("created_at"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unknown_id_opens_fresh_session() {
        let store = SessionStore::in_memory();
        let handle = store.open("client-chosen").await.unwrap();
        let session = handle.lock().await;
        assert_eq!(session.id, "client-chosen");
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_same_id_shares_one_session() {
        let store = SessionStore::in_memory();
        let id = store.create();
        let a = store.open(&id).await.unwrap();
        let b = store.open(&id).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_turns_survive_restart() {
        let tmp = TempDir::new().unwrap();
        let config = Config::minimal(tmp.path().join("s.sqlite"));
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();

        let store = SessionStore::persistent(pool.clone());
        let handle = store.open("s1").await.unwrap();
        {
            let mut session = handle.lock().await;
            store
                .record_exchange(&mut session, "what is a cat?", "A small feline [1].", 100)
                .await
                .unwrap();
        }

        let reopened = SessionStore::persistent(pool);
        let handle = reopened.open("s1").await.unwrap();
        let session = handle.lock().await;
        assert_eq!(session.turns.len(), 2);
        assert_eq!(session.turns[0].role, Role::User);
        assert_eq!(session.turns[1].text, "A small feline [1].");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_are_evicted() {
        let store = SessionStore::in_memory().with_idle_timeout(Duration::from_secs(60));
        let idle = store.create();
        let busy = store.open("busy").await.unwrap();
        assert_eq!(store.len(), 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.evict_idle(), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        // "busy" is still held, so only the idle one goes
        assert_eq!(store.evict_idle(), 1);
        assert_eq!(store.len(), 1);

        drop(busy);
        let reopened = store.open(&idle).await.unwrap();
        assert!(reopened.lock().await.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_refreshes_idle_clock() {
        let store = SessionStore::in_memory().with_idle_timeout(Duration::from_secs(50));
        let id = store.create();
        tokio::time::advance(Duration::from_secs(30)).await;
        drop(store.open(&id).await.unwrap());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.evict_idle(), 0);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.evict_idle(), 1);
    }

    #[tokio::test]
    async fn test_end_forgets_persisted_turns() {
        let tmp = TempDir::new().unwrap();
        let config = Config::minimal(tmp.path().join("s.sqlite"));
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();

        let store = SessionStore::persistent(pool.clone());
        let handle = store.open("s1").await.unwrap();
        {
            let mut session = handle.lock().await;
            store
                .record_exchange(&mut session, "q", "a", 100)
                .await
                .unwrap();
        }
        drop(handle);

        assert!(store.end("s1").await.unwrap());
        assert!(store.is_empty());
        assert!(!store.end("s1").await.unwrap());

        let reopened = SessionStore::persistent(pool);
        let handle = reopened.open("s1").await.unwrap();
        assert!(handle.lock().await.is_empty());
    }
}
