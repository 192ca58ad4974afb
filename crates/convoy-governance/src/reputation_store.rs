//! Persistence boundary for agent reputation.
//!
//! Every mutating operation is a single named, atomic operation on the
//! backend (idempotent upsert, floored increment) so two engines sharing a
//! database never lose an update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::{ConvoyError, ConvoyResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Persisted agent row. The permission level is not stored; it is derived
/// from `score` whenever a record is materialised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAgent {
    pub agent_id: String,
    pub agent_type: String,
    pub score: i64,
    pub last_activity: DateTime<Utc>,
    /// Last time decay was applied, if ever.
    pub last_decay_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One applied reputation change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationEvent {
    pub agent_id: String,
    pub event_type: String,
    /// Delta from the scoring table (before flooring).
    pub delta: i64,
    pub score_after: i64,
    pub trace_id: Option<String>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Storage operations the reputation engine needs.
#[async_trait]
pub trait ReputationStore: Send + Sync {
    /// Insert the agent if absent; return the current row either way.
    async fn upsert_agent(
        &self,
        agent_id: &str,
        agent_type: &str,
        initial_score: i64,
        now: DateTime<Utc>,
    ) -> ConvoyResult<StoredAgent>;

    async fn get_agent(&self, agent_id: &str) -> ConvoyResult<Option<StoredAgent>>;

    /// Atomically apply `score = max(floor, score + delta)` and touch
    /// `last_activity`. Returns the new score; `NotFound` for unknown agents.
    async fn increment_score(
        &self,
        agent_id: &str,
        delta: i64,
        floor: i64,
        now: DateTime<Utc>,
    ) -> ConvoyResult<i64>;

    /// Atomically apply `score = max(floor, score - amount)` and stamp
    /// `last_decay_at` without touching `last_activity`. Returns the score
    /// `(before, after)` as seen inside the same atomic step.
    async fn decay_score(
        &self,
        agent_id: &str,
        amount: i64,
        floor: i64,
        now: DateTime<Utc>,
    ) -> ConvoyResult<(i64, i64)>;

    async fn append_history(&self, event: &ReputationEvent) -> ConvoyResult<()>;

    /// Most recent events first.
    async fn history(&self, agent_id: &str, limit: usize) -> ConvoyResult<Vec<ReputationEvent>>;

    async fn list_agents(&self) -> ConvoyResult<Vec<StoredAgent>>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Events kept per agent by [`MemoryReputationStore`] unless overridden.
pub const DEFAULT_MEMORY_HISTORY: usize = 1000;

#[derive(Default)]
struct MemoryInner {
    agents: HashMap<String, StoredAgent>,
    history: HashMap<String, VecDeque<ReputationEvent>>,
}

/// Reputation store that lives in process memory. Each agent keeps only its
/// most recent events.
pub struct MemoryReputationStore {
    inner: Mutex<MemoryInner>,
    history_limit: usize,
}

impl MemoryReputationStore {
    /// Store keeping [`DEFAULT_MEMORY_HISTORY`] events per agent.
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_MEMORY_HISTORY)
    }

    /// Store keeping at most `history_limit` (at least one) events per agent.
    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            history_limit: history_limit.max(1),
        }
    }
}

impl Default for MemoryReputationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReputationStore for MemoryReputationStore {
    async fn upsert_agent(
        &self,
        agent_id: &str,
        agent_type: &str,
        initial_score: i64,
        now: DateTime<Utc>,
    ) -> ConvoyResult<StoredAgent> {
        let mut inner = self.inner.lock();
        let agent = inner
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| StoredAgent {
                agent_id: agent_id.to_string(),
                agent_type: agent_type.to_string(),
                score: initial_score,
                last_activity: now,
                last_decay_at: None,
                created_at: now,
            });
        Ok(agent.clone())
    }

    async fn get_agent(&self, agent_id: &str) -> ConvoyResult<Option<StoredAgent>> {
        Ok(self.inner.lock().agents.get(agent_id).cloned())
    }

    async fn increment_score(
        &self,
        agent_id: &str,
        delta: i64,
        floor: i64,
        now: DateTime<Utc>,
    ) -> ConvoyResult<i64> {
        let mut inner = self.inner.lock();
        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ConvoyError::NotFound(format!("agent '{agent_id}'")))?;
        agent.score = (agent.score + delta).max(floor);
        agent.last_activity = now;
        Ok(agent.score)
    }

    async fn decay_score(
        &self,
        agent_id: &str,
        amount: i64,
        floor: i64,
        now: DateTime<Utc>,
    ) -> ConvoyResult<(i64, i64)> {
        let mut inner = self.inner.lock();
        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ConvoyError::NotFound(format!("agent '{agent_id}'")))?;
        let before = agent.score;
        agent.score = (agent.score - amount).max(floor);
        agent.last_decay_at = Some(now);
        Ok((before, agent.score))
    }

    async fn append_history(&self, event: &ReputationEvent) -> ConvoyResult<()> {
        let mut inner = self.inner.lock();
        let events = inner.history.entry(event.agent_id.clone()).or_default();
        events.push_back(event.clone());
        while events.len() > self.history_limit {
            events.pop_front();
        }
        Ok(())
    }

    async fn history(&self, agent_id: &str, limit: usize) -> ConvoyResult<Vec<ReputationEvent>> {
        let inner = self.inner.lock();
        Ok(inner
            .history
            .get(agent_id)
            .map(|events| events.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_agents(&self) -> ConvoyResult<Vec<StoredAgent>> {
        Ok(self.inner.lock().agents.values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS agents (
        agent_id      TEXT PRIMARY KEY,
        agent_type    TEXT NOT NULL,
        score         INTEGER NOT NULL,
        last_activity TEXT NOT NULL,
        last_decay_at TEXT,
        created_at    TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS reputation_events (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        agent_id    TEXT NOT NULL,
        event_type  TEXT NOT NULL,
        delta       INTEGER NOT NULL,
        score_after INTEGER NOT NULL,
        trace_id    TEXT,
        reason      TEXT,
        created_at  TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_reputation_events_agent
        ON reputation_events(agent_id, id);
";

const AGENT_COLUMNS: &str =
    "agent_id, agent_type, score, last_activity, last_decay_at, created_at";

/// Reputation store persisted in a SQLite database.
///
/// The connection is shared behind a mutex and every call runs on the
/// blocking thread pool.
#[derive(Clone)]
pub struct SqliteReputationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteReputationStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> ConvoyResult<Self> {
        let conn = Connection::open(path.as_ref()).map_err(sql_err)?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.as_ref().display(), "Opened reputation database");
        Ok(store)
    }

    /// Purely in-memory database.
    pub fn open_in_memory() -> ConvoyResult<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(sql_err)?)
    }

    fn from_connection(conn: Connection) -> ConvoyResult<Self> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> ConvoyResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> ConvoyResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut *guard)
        })
        .await
        .map_err(|e| ConvoyError::Internal(format!("reputation store task failed: {e}")))?
    }
}

fn sql_err(e: rusqlite::Error) -> ConvoyError {
    ConvoyError::store(format!("sqlite: {e}"))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<StoredAgent> {
    let last_activity: String = row.get(3)?;
    let last_decay_at: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(StoredAgent {
        agent_id: row.get(0)?,
        agent_type: row.get(1)?,
        score: row.get(2)?,
        last_activity: parse_time(&last_activity)?,
        last_decay_at: last_decay_at.as_deref().map(parse_time).transpose()?,
        created_at: parse_time(&created_at)?,
    })
}

fn select_agent(conn: &Connection, agent_id: &str) -> ConvoyResult<Option<StoredAgent>> {
    conn.query_row(
        &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?1"),
        params![agent_id],
        agent_from_row,
    )
    .optional()
    .map_err(sql_err)
}

fn select_score(conn: &Connection, agent_id: &str) -> ConvoyResult<i64> {
    conn.query_row(
        "SELECT score FROM agents WHERE agent_id = ?1",
        params![agent_id],
        |row| row.get(0),
    )
    .map_err(sql_err)
}

#[async_trait]
impl ReputationStore for SqliteReputationStore {
    async fn upsert_agent(
        &self,
        agent_id: &str,
        agent_type: &str,
        initial_score: i64,
        now: DateTime<Utc>,
    ) -> ConvoyResult<StoredAgent> {
        let agent_id = agent_id.to_string();
        let agent_type = agent_type.to_string();
        self.call(move |conn| {
            let ts = now.to_rfc3339();
            conn.execute(
                "INSERT INTO agents (agent_id, agent_type, score, last_activity, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(agent_id) DO NOTHING",
                params![agent_id, agent_type, initial_score, ts],
            )
            .map_err(sql_err)?;
            select_agent(conn, &agent_id)?
                .ok_or_else(|| ConvoyError::Internal(format!("agent '{agent_id}' vanished")))
        })
        .await
    }

    async fn get_agent(&self, agent_id: &str) -> ConvoyResult<Option<StoredAgent>> {
        let agent_id = agent_id.to_string();
        self.call(move |conn| select_agent(conn, &agent_id)).await
    }

    async fn increment_score(
        &self,
        agent_id: &str,
        delta: i64,
        floor: i64,
        now: DateTime<Utc>,
    ) -> ConvoyResult<i64> {
        let agent_id = agent_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            let changed = tx
                .execute(
                    "UPDATE agents SET score = MAX(?2, score + ?3), last_activity = ?4
                     WHERE agent_id = ?1",
                    params![agent_id, floor, delta, now.to_rfc3339()],
                )
                .map_err(sql_err)?;
            if changed == 0 {
                return Err(ConvoyError::NotFound(format!("agent '{agent_id}'")));
            }
            let score = select_score(&tx, &agent_id)?;
            tx.commit().map_err(sql_err)?;
            Ok(score)
        })
        .await
    }

    async fn decay_score(
        &self,
        agent_id: &str,
        amount: i64,
        floor: i64,
        now: DateTime<Utc>,
    ) -> ConvoyResult<(i64, i64)> {
        let agent_id = agent_id.to_string();
        self.call(move |conn| {
            // Immediate: hold the write lock from the first read.
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err)?;
            let before: Option<i64> = tx
                .query_row(
                    "SELECT score FROM agents WHERE agent_id = ?1",
                    params![agent_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            let Some(before) = before else {
                return Err(ConvoyError::NotFound(format!("agent '{agent_id}'")));
            };
            tx.execute(
                "UPDATE agents SET score = MAX(?2, score - ?3), last_decay_at = ?4
                 WHERE agent_id = ?1",
                params![agent_id, floor, amount, now.to_rfc3339()],
            )
            .map_err(sql_err)?;
            let after = select_score(&tx, &agent_id)?;
            tx.commit().map_err(sql_err)?;
            Ok((before, after))
        })
        .await
    }

    async fn append_history(&self, event: &ReputationEvent) -> ConvoyResult<()> {
        let event = event.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO reputation_events
                 (agent_id, event_type, delta, score_after, trace_id, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.agent_id,
                    event.event_type,
                    event.delta,
                    event.score_after,
                    event.trace_id,
                    event.reason,
                    event.timestamp.to_rfc3339(),
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn history(&self, agent_id: &str, limit: usize) -> ConvoyResult<Vec<ReputationEvent>> {
        let agent_id = agent_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT agent_id, event_type, delta, score_after, trace_id, reason, created_at
                     FROM reputation_events WHERE agent_id = ?1
                     ORDER BY id DESC LIMIT ?2",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![agent_id, limit], |row| {
                    let ts: String = row.get(6)?;
                    Ok(ReputationEvent {
                        agent_id: row.get(0)?,
                        event_type: row.get(1)?,
                        delta: row.get(2)?,
                        score_after: row.get(3)?,
                        trace_id: row.get(4)?,
                        reason: row.get(5)?,
                        timestamp: parse_time(&ts)?,
                    })
                })
                .map_err(sql_err)?;
            let events = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err);
            events
        })
        .await
    }

    async fn list_agents(&self) -> ConvoyResult<Vec<StoredAgent>> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents"))
                .map_err(sql_err)?;
            let rows = stmt.query_map([], agent_from_row).map_err(sql_err)?;
            let agents = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err);
            agents
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn ReputationStore) {
        let now = Utc::now();
        let first = store.upsert_agent("code_agent", "code_agent", 100, now).await.unwrap();
        assert_eq!(first.score, 100);
        // idempotent
        let again = store.upsert_agent("code_agent", "code_agent", 999, now).await.unwrap();
        assert_eq!(again.score, 100);

        assert_eq!(store.increment_score("code_agent", 20, 0, now).await.unwrap(), 120);
        assert_eq!(store.increment_score("code_agent", -500, 0, now).await.unwrap(), 0);
        assert!(matches!(
            store.increment_score("ghost", 1, 0, now).await,
            Err(ConvoyError::NotFound(_))
        ));

        for (i, kind) in ["task_completed", "test_passed"].iter().enumerate() {
            store
                .append_history(&ReputationEvent {
                    agent_id: "code_agent".into(),
                    event_type: (*kind).into(),
                    delta: 10,
                    score_after: 10 * (i as i64 + 1),
                    trace_id: None,
                    reason: None,
                    timestamp: now,
                })
                .await
                .unwrap();
        }
        let history = store.history("code_agent", 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, "test_passed");
        assert_eq!(store.list_agents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryReputationStore::new()).await;
    }

    #[tokio::test]
    async fn test_memory_history_is_bounded_per_agent() {
        let store = MemoryReputationStore::with_history_limit(5);
        let now = Utc::now();
        for agent in ["a", "b"] {
            for i in 0..12 {
                store
                    .append_history(&ReputationEvent {
                        agent_id: agent.into(),
                        event_type: "task_completed".into(),
                        delta: 10,
                        score_after: i,
                        trace_id: None,
                        reason: None,
                        timestamp: now,
                    })
                    .await
                    .unwrap();
            }
        }
        let history = store.history("a", 100).await.unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].score_after, 11);
        assert_eq!(history[4].score_after, 7);
        assert_eq!(store.history("b", 100).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let store = SqliteReputationStore::open_in_memory().unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_decay_keeps_last_activity() {
        let store = SqliteReputationStore::open_in_memory().unwrap();
        let then = Utc::now() - chrono::Duration::days(30);
        store.upsert_agent("a", "a", 100, then).await.unwrap();
        let change = store.decay_score("a", 15, 0, Utc::now()).await.unwrap();
        assert_eq!(change, (100, 85));
        let change = store.decay_score("a", 200, 10, Utc::now()).await.unwrap();
        assert_eq!(change, (85, 10));
        let agent = store.get_agent("a").await.unwrap().unwrap();
        assert!(agent.last_decay_at.is_some());
        assert_eq!(agent.last_activity.timestamp(), then.timestamp());
    }
}
