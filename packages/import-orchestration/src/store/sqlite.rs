use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::state::{ImportState, StateStore};
use crate::waiter::{CounterStore, WaiterKey};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS import_waiters (
        key TEXT PRIMARY KEY,
        remaining INTEGER NOT NULL CHECK (remaining >= 0),
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS import_states (
        subject_id TEXT PRIMARY KEY,
        alive INTEGER NOT NULL,
        liveness_deadline INTEGER NOT NULL,
        payload TEXT NOT NULL,
        revision INTEGER NOT NULL DEFAULT 0,
        expires_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_import_states_liveness
        ON import_states (alive, liveness_deadline)",
];

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn revision(revision: u64) -> Result<i64> {
    i64::try_from(revision).map_err(PipelineError::parse)
}

/// SQLite-backed store shared by every worker process pointing at the same file
///
/// Every write is a single statement (counter decrements and heartbeats are
/// conditional `UPDATE`s), which SQLite serializes, so callers need no locking
/// of their own and writers only ever wait on the busy timeout.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    waiter_ttl: Duration,
    state_ttl: Duration,
}

impl SqliteStore {
    /// Connect (creating the database file if needed) and apply the schema
    pub async fn connect(url: &str, config: &PipelineConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let connections = u32::try_from(config.workers)
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        let pool = SqlitePoolOptions::new()
            .max_connections(connections)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool, config);
        store.migrate().await?;
        info!("SqliteStore connected: {}", url);
        Ok(store)
    }

    /// Private in-memory database (one connection, never recycled)
    pub async fn in_memory(config: &PipelineConfig) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::from_pool(pool, config);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool, config: &PipelineConfig) -> Self {
        Self {
            pool,
            waiter_ttl: config.waiter_ttl(),
            state_ttl: config.state_ttl(),
        }
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn encode(state: &ImportState) -> Result<String> {
        serde_json::to_string(state).map_err(PipelineError::serialization)
    }

    fn decode(payload: &str) -> Result<ImportState> {
        serde_json::from_str(payload).map_err(PipelineError::serialization)
    }
}

#[async_trait]
impl CounterStore for SqliteStore {
    async fn create(&self, initial: u64) -> Result<WaiterKey> {
        let key = WaiterKey::generate();
        let initial = i64::try_from(initial).map_err(PipelineError::parse)?;

        sqlx::query("INSERT INTO import_waiters (key, remaining, expires_at) VALUES (?1, ?2, ?3)")
            .bind(key.as_str())
            .bind(initial)
            .bind(millis(Utc::now() + self.waiter_ttl))
            .execute(&self.pool)
            .await?;
        Ok(key)
    }

    async fn decrement(&self, key: &WaiterKey) -> Result<()> {
        sqlx::query(
            "UPDATE import_waiters SET remaining = remaining - 1
             WHERE key = ?1 AND remaining > 0 AND expires_at > ?2",
        )
        .bind(key.as_str())
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remaining(&self, key: &WaiterKey) -> Result<u64> {
        let row = sqlx::query(
            "SELECT remaining FROM import_waiters WHERE key = ?1 AND expires_at > ?2",
        )
        .bind(key.as_str())
        .bind(millis(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let remaining: i64 = row.try_get("remaining")?;
                Ok(remaining.max(0) as u64)
            }
            None => Ok(0),
        }
    }

    async fn discard(&self, key: &WaiterKey) -> Result<()> {
        sqlx::query("DELETE FROM import_waiters WHERE key = ?1")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let result = sqlx::query("DELETE FROM import_waiters WHERE expires_at <= ?1")
            .bind(millis(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn insert(&self, state: &ImportState) -> Result<()> {
        let now = Utc::now();
        // The upsert only overwrites dead or expired runs; zero affected rows
        // means a live run already owns this subject.
        let result = sqlx::query(
            "INSERT INTO import_states
                (subject_id, alive, liveness_deadline, payload, revision, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(subject_id) DO UPDATE SET
                alive = excluded.alive,
                liveness_deadline = excluded.liveness_deadline,
                payload = excluded.payload,
                revision = excluded.revision,
                expires_at = excluded.expires_at
             WHERE import_states.alive = 0 OR import_states.expires_at <= ?7",
        )
        .bind(state.subject_id.as_str())
        .bind(state.alive)
        .bind(millis(state.liveness_deadline))
        .bind(Self::encode(state)?)
        .bind(revision(state.revision)?)
        .bind(millis(now + self.state_ttl))
        .bind(millis(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::AlreadyRunning(state.subject_id.clone()));
        }
        Ok(())
    }

    async fn load(&self, subject_id: &str) -> Result<Option<ImportState>> {
        let row = sqlx::query(
            "SELECT payload FROM import_states WHERE subject_id = ?1 AND expires_at > ?2",
        )
        .bind(subject_id)
        .bind(millis(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let payload: String = row.try_get("payload")?;
                Ok(Some(Self::decode(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, state: &ImportState) -> Result<()> {
        sqlx::query(
            "INSERT INTO import_states
                (subject_id, alive, liveness_deadline, payload, revision, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(subject_id) DO UPDATE SET
                alive = excluded.alive,
                liveness_deadline = excluded.liveness_deadline,
                payload = excluded.payload,
                revision = excluded.revision,
                expires_at = excluded.expires_at",
        )
        .bind(state.subject_id.as_str())
        .bind(state.alive)
        .bind(millis(state.liveness_deadline))
        .bind(Self::encode(state)?)
        .bind(revision(state.revision)?)
        .bind(millis(Utc::now() + self.state_ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn compare_and_save(&self, state: &mut ImportState) -> Result<bool> {
        let now = Utc::now();
        let mut next = state.clone();
        next.revision += 1;

        let result = sqlx::query(
            "UPDATE import_states
             SET alive = ?2, liveness_deadline = ?3, payload = ?4, revision = ?5, expires_at = ?6
             WHERE subject_id = ?1 AND revision = ?7 AND expires_at > ?8",
        )
        .bind(next.subject_id.as_str())
        .bind(next.alive)
        .bind(millis(next.liveness_deadline))
        .bind(Self::encode(&next)?)
        .bind(revision(next.revision)?)
        .bind(millis(now + self.state_ttl))
        .bind(revision(state.revision)?)
        .bind(millis(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }
        *state = next;
        Ok(true)
    }

    async fn refresh_deadline(&self, subject_id: &str, deadline: DateTime<Utc>) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE import_states
             SET liveness_deadline = ?2,
                 payload = json_set(payload, '$.liveness_deadline', ?3),
                 expires_at = ?4
             WHERE subject_id = ?1 AND expires_at > ?5",
        )
        .bind(subject_id)
        .bind(millis(deadline))
        .bind(deadline.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .bind(millis(now + self.state_ttl))
        .bind(millis(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::ImportNotFound(subject_id.to_string()));
        }
        Ok(())
    }

    async fn stalled(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT subject_id FROM import_states
             WHERE alive = 1 AND liveness_deadline <= ?1 AND expires_at > ?1
             ORDER BY subject_id",
        )
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("subject_id").map_err(Into::into))
            .collect()
    }

    async fn remove(&self, subject_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM import_states WHERE subject_id = ?1")
            .bind(subject_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let result = sqlx::query("DELETE FROM import_states WHERE expires_at <= ?1")
            .bind(millis(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}
