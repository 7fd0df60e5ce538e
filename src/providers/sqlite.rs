//! SQLite-backed provider. History, instances, both queues, and batch locks
//! live in one database so a fetched batch can be acked in a single
//! transaction: history delta, instance metadata, follow-up enqueues, and
//! lock release all commit together.
use std::process;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::{now_ms, Event};

use super::{ExecutionMetadata, InstanceSnapshot, Provider, ProviderError, WorkItem, WorkflowItem};

pub struct SqliteProvider {
    pool: SqlitePool,
}

fn generate_lock_token() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("lock_{}_{}", nanos, process::id())
}

fn sqlx_err(operation: &str, e: sqlx::Error) -> ProviderError {
    let msg = e.to_string();
    if let sqlx::Error::Database(db) = &e {
        let raw = db.message().to_lowercase();
        if raw.contains("unique constraint") {
            return ProviderError::conflict(operation, msg);
        }
        if raw.contains("locked") || raw.contains("busy") {
            return ProviderError::retryable(operation, msg);
        }
    }
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => ProviderError::retryable(operation, msg),
        _ => ProviderError::permanent(operation, msg),
    }
}

impl SqliteProvider {
    /// Open (and migrate) a database file at the given path.
    pub async fn new(path: &str) -> Result<Self, ProviderError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| ProviderError::permanent("connect", e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| sqlx_err("connect", e))?;
        let provider = Self { pool };
        provider.migrate().await?;
        Ok(provider)
    }

    /// Open an in-memory database, useful for tests.
    pub async fn new_in_memory() -> Result<Self, ProviderError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ProviderError::permanent("connect", e.to_string()))?;
        // A single kept-alive connection, or the in-memory database vanishes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| sqlx_err("connect", e))?;
        let provider = Self { pool };
        provider.migrate().await?;
        Ok(provider)
    }

    async fn migrate(&self) -> Result<(), ProviderError> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id   TEXT PRIMARY KEY,
                workflow_name TEXT NOT NULL,
                status        TEXT NOT NULL DEFAULT 'Pending',
                input         TEXT NOT NULL,
                output        TEXT,
                created_at    INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                event_id    INTEGER NOT NULL,
                event_type  TEXT NOT NULL,
                event_data  TEXT NOT NULL,
                PRIMARY KEY (instance_id, event_id)
            );

            CREATE TABLE IF NOT EXISTS workflow_queue (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id  TEXT NOT NULL,
                work_item    TEXT NOT NULL,
                visible_at   INTEGER NOT NULL,
                lock_token   TEXT,
                locked_until INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS worker_queue (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id  TEXT NOT NULL,
                work_item    TEXT NOT NULL,
                visible_at   INTEGER NOT NULL,
                lock_token   TEXT,
                locked_until INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS instance_locks (
                instance_id  TEXT PRIMARY KEY,
                lock_token   TEXT NOT NULL,
                locked_until INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_workflow_queue_visible
                ON workflow_queue (visible_at, instance_id);
            CREATE INDEX IF NOT EXISTS idx_worker_queue_visible
                ON worker_queue (visible_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| sqlx_err("migrate", e))?;
        Ok(())
    }

    fn serialize_item(operation: &str, item: &WorkItem) -> Result<String, ProviderError> {
        serde_json::to_string(item).map_err(|e| ProviderError::permanent(operation, e.to_string()))
    }

    fn deserialize_item(operation: &str, raw: &str) -> Result<WorkItem, ProviderError> {
        serde_json::from_str(raw).map_err(|e| ProviderError::permanent(operation, e.to_string()))
    }

    async fn enqueue(
        &self,
        table: &str,
        item: WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let operation = format!("enqueue_{table}");
        let payload = Self::serialize_item(&operation, &item)?;
        let visible_at = now_ms() as i64 + delay.map(|d| d.as_millis() as i64).unwrap_or(0);
        let sql = format!(
            "INSERT INTO {table} (instance_id, work_item, visible_at) VALUES (?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(item.instance())
            .bind(payload)
            .bind(visible_at)
            .execute(&self.pool)
            .await
            .map_err(|e| sqlx_err(&operation, e))?;
        Ok(())
    }
}

#[async_trait]
impl Provider for SqliteProvider {
    async fn create_instance(
        &self,
        instance: &str,
        workflow: &str,
        input: &str,
    ) -> Result<(), ProviderError> {
        sqlx::query(
            "INSERT INTO instances (instance_id, workflow_name, status, input, created_at) \
             VALUES (?, ?, 'Pending', ?, ?)",
        )
        .bind(instance)
        .bind(workflow)
        .bind(input)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| sqlx_err("create_instance", e))?;
        Ok(())
    }

    async fn read(&self, instance: &str) -> Vec<Event> {
        let rows = sqlx::query(
            "SELECT event_data FROM history WHERE instance_id = ? ORDER BY event_id ASC",
        )
        .bind(instance)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();
        rows.iter()
            .filter_map(|row| {
                let raw: String = row.get("event_data");
                serde_json::from_str::<Event>(&raw).ok()
            })
            .collect()
    }

    async fn instance_snapshot(&self, instance: &str) -> Option<InstanceSnapshot> {
        let row = sqlx::query(
            "SELECT instance_id, workflow_name, status, output, created_at \
             FROM instances WHERE instance_id = ?",
        )
        .bind(instance)
        .fetch_optional(&self.pool)
        .await
        .ok()??;
        Some(InstanceSnapshot {
            instance: row.get("instance_id"),
            workflow_name: row.get("workflow_name"),
            status: row.get("status"),
            output: row.get("output"),
            created_at_ms: row.get::<i64, _>("created_at") as u64,
        })
    }

    async fn list_instances(&self) -> Vec<String> {
        let rows = sqlx::query("SELECT instance_id FROM instances ORDER BY instance_id")
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default();
        rows.iter().map(|r| r.get("instance_id")).collect()
    }

    async fn enqueue_workflow_work(
        &self,
        item: WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        self.enqueue("workflow_queue", item, delay).await
    }

    async fn enqueue_worker_work(
        &self,
        item: WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        self.enqueue("worker_queue", item, delay).await
    }

    async fn fetch_workflow_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<WorkflowItem>, ProviderError> {
        let op = "fetch_workflow_item";
        let now = now_ms() as i64;
        let mut tx = self.pool.begin().await.map_err(|e| sqlx_err(op, e))?;

        // Oldest instance with a visible, unlocked message
        let candidate = sqlx::query(
            "SELECT instance_id FROM workflow_queue \
             WHERE visible_at <= ? AND (lock_token IS NULL OR locked_until <= ?) \
             ORDER BY id ASC LIMIT 1",
        )
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| sqlx_err(op, e))?;
        let Some(row) = candidate else {
            return Ok(None);
        };
        let instance: String = row.get("instance_id");

        // Acquire (or steal an expired) instance lock
        let token = generate_lock_token();
        let locked_until = now + lock_timeout.as_millis() as i64;
        let acquired = sqlx::query(
            "INSERT INTO instance_locks (instance_id, lock_token, locked_until) VALUES (?, ?, ?) \
             ON CONFLICT(instance_id) DO UPDATE SET lock_token = excluded.lock_token, \
             locked_until = excluded.locked_until WHERE instance_locks.locked_until <= ?",
        )
        .bind(&instance)
        .bind(&token)
        .bind(locked_until)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| sqlx_err(op, e))?;
        if acquired.rows_affected() == 0 {
            // Another host is working on this instance
            return Ok(None);
        }

        sqlx::query(
            "UPDATE workflow_queue SET lock_token = ?, locked_until = ? \
             WHERE instance_id = ? AND visible_at <= ? \
             AND (lock_token IS NULL OR locked_until <= ?)",
        )
        .bind(&token)
        .bind(locked_until)
        .bind(&instance)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| sqlx_err(op, e))?;

        let message_rows = sqlx::query(
            "SELECT work_item FROM workflow_queue WHERE lock_token = ? ORDER BY id ASC",
        )
        .bind(&token)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| sqlx_err(op, e))?;
        let mut messages = Vec::with_capacity(message_rows.len());
        for row in &message_rows {
            let raw: String = row.get("work_item");
            messages.push(Self::deserialize_item(op, &raw)?);
        }

        let history_rows = sqlx::query(
            "SELECT event_data FROM history WHERE instance_id = ? ORDER BY event_id ASC",
        )
        .bind(&instance)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| sqlx_err(op, e))?;
        let mut history = Vec::with_capacity(history_rows.len());
        for row in &history_rows {
            let raw: String = row.get("event_data");
            let ev = serde_json::from_str::<Event>(&raw)
                .map_err(|e| ProviderError::permanent(op, e.to_string()))?;
            history.push(ev);
        }

        let workflow_name: String = sqlx::query(
            "SELECT workflow_name FROM instances WHERE instance_id = ?",
        )
        .bind(&instance)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| sqlx_err(op, e))?
        .map(|r| r.get("workflow_name"))
        .unwrap_or_default();

        tx.commit().await.map_err(|e| sqlx_err(op, e))?;
        Ok(Some(WorkflowItem {
            instance,
            workflow_name,
            history,
            messages,
            lock_token: token,
        }))
    }

    async fn ack_workflow_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        workflow_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        let op = "ack_workflow_item";
        let mut tx = self.pool.begin().await.map_err(|e| sqlx_err(op, e))?;

        let lock_row = sqlx::query(
            "SELECT instance_id FROM instance_locks WHERE lock_token = ?",
        )
        .bind(lock_token)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| sqlx_err(op, e))?
        .ok_or_else(|| {
            ProviderError::permanent(op, format!("lock token not held: {lock_token}"))
        })?;
        let instance: String = lock_row.get("instance_id");

        for ev in &history_delta {
            if ev.event_id == 0 {
                return Err(ProviderError::permanent(op, "history event with unassigned event_id"));
            }
            let payload = serde_json::to_string(ev)
                .map_err(|e| ProviderError::permanent(op, e.to_string()))?;
            sqlx::query(
                "INSERT INTO history (instance_id, event_id, event_type, event_data) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&instance)
            .bind(ev.event_id as i64)
            .bind(ev.kind_name())
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| sqlx_err(op, e))?;
        }

        if metadata.status.is_some() || metadata.output.is_some() {
            sqlx::query(
                "UPDATE instances SET status = COALESCE(?, status), \
                 output = COALESCE(?, output) WHERE instance_id = ?",
            )
            .bind(metadata.status)
            .bind(metadata.output)
            .bind(&instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| sqlx_err(op, e))?;
        }

        let now = now_ms() as i64;
        for item in &worker_items {
            let payload = Self::serialize_item(op, item)?;
            sqlx::query(
                "INSERT INTO worker_queue (instance_id, work_item, visible_at) VALUES (?, ?, ?)",
            )
            .bind(item.instance())
            .bind(payload)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| sqlx_err(op, e))?;
        }
        for item in &workflow_items {
            let payload = Self::serialize_item(op, item)?;
            sqlx::query(
                "INSERT INTO workflow_queue (instance_id, work_item, visible_at) VALUES (?, ?, ?)",
            )
            .bind(item.instance())
            .bind(payload)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| sqlx_err(op, e))?;
        }

        sqlx::query("DELETE FROM workflow_queue WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| sqlx_err(op, e))?;
        sqlx::query("DELETE FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| sqlx_err(op, e))?;

        tx.commit().await.map_err(|e| sqlx_err(op, e))?;
        Ok(())
    }

    async fn abandon_workflow_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let op = "abandon_workflow_item";
        let mut tx = self.pool.begin().await.map_err(|e| sqlx_err(op, e))?;
        sqlx::query(
            "UPDATE workflow_queue SET lock_token = NULL, locked_until = 0 WHERE lock_token = ?",
        )
        .bind(lock_token)
        .execute(&mut *tx)
        .await
        .map_err(|e| sqlx_err(op, e))?;
        sqlx::query("DELETE FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| sqlx_err(op, e))?;
        tx.commit().await.map_err(|e| sqlx_err(op, e))?;
        Ok(())
    }

    async fn dequeue_worker_peek_lock(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let op = "dequeue_worker_peek_lock";
        let now = now_ms() as i64;
        let token = generate_lock_token();
        let locked_until = now + lock_timeout.as_millis() as i64;
        let mut tx = self.pool.begin().await.map_err(|e| sqlx_err(op, e))?;
        let row = sqlx::query(
            "SELECT id, work_item FROM worker_queue \
             WHERE visible_at <= ? AND (lock_token IS NULL OR locked_until <= ?) \
             ORDER BY id ASC LIMIT 1",
        )
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| sqlx_err(op, e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.get("id");
        let raw: String = row.get("work_item");
        sqlx::query("UPDATE worker_queue SET lock_token = ?, locked_until = ? WHERE id = ?")
            .bind(&token)
            .bind(locked_until)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| sqlx_err(op, e))?;
        tx.commit().await.map_err(|e| sqlx_err(op, e))?;
        let item = Self::deserialize_item(op, &raw)?;
        Ok(Some((item, token)))
    }

    async fn ack_worker(&self, lock_token: &str) -> Result<(), ProviderError> {
        sqlx::query("DELETE FROM worker_queue WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&self.pool)
            .await
            .map_err(|e| sqlx_err("ack_worker", e))?;
        Ok(())
    }

    async fn abandon_worker(&self, lock_token: &str) -> Result<(), ProviderError> {
        sqlx::query(
            "UPDATE worker_queue SET lock_token = NULL, locked_until = 0 WHERE lock_token = ?",
        )
        .bind(lock_token)
        .execute(&self.pool)
        .await
        .map_err(|e| sqlx_err("abandon_worker", e))?;
        Ok(())
    }
}
