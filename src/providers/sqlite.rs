use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::time::Duration;
use tracing::debug;

use super::{
    ExecutionMetadata, ExecutionStatus, InstanceInfo, OrchestrationItem, Provider, ProviderError, WorkItem,
};
use crate::Event;

/// Configuration options for [`SqliteProvider`].
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Pool size for file databases. In-memory databases always use one connection.
    pub max_connections: u32,
    /// SQLite busy timeout applied to every connection.
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(60),
        }
    }
}

/// SQLite-backed provider with full transactional support.
///
/// Every ack is a single transaction covering history, execution status,
/// outgoing queue items and the instance lock release.
pub struct SqliteProvider {
    pool: SqlitePool,
}

impl SqliteProvider {
    /// Convert sqlx error to ProviderError with appropriate retry classification
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        // SQLITE_BUSY and shared-cache table locks clear up on their own
        if error_msg.contains("locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }

        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }

        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }

        ProviderError::retryable(operation, error_msg)
    }

    fn generate_lock_token() -> String {
        format!("lock_{}", uuid::Uuid::new_v4())
    }

    fn now_millis() -> i64 {
        crate::now_millis() as i64
    }

    fn timestamp_after(duration: Duration) -> i64 {
        Self::now_millis().saturating_add(duration.as_millis().min(i64::MAX as u128) as i64)
    }

    /// Open (and create if needed) a SQLite database.
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string, e.g. `sqlite:research.db?mode=rwc` or `sqlite::memory:`
    /// * `options` - Pool and pragma settings, defaults when `None`
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema initialization fails.
    pub async fn new(database_url: &str, options: Option<SqliteOptions>) -> Result<Self, sqlx::Error> {
        let options = options.unwrap_or_default();
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let busy_timeout_ms = options.busy_timeout.as_millis() as i64;

        let mut pool_options = SqlitePoolOptions::new();
        if is_memory {
            // An in-memory database lives as long as its connection
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            pool_options = pool_options.max_connections(options.max_connections.max(1));
        }

        let pool = pool_options
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query(&format!("PRAGMA busy_timeout = {busy_timeout_ms}"))
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        Self::create_schema(&pool).await?;
        debug!(target: "durable_research::providers::sqlite", database_url, "SQLite provider ready");
        Ok(Self { pool })
    }

    /// Fresh private in-memory database, handy for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:", None).await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                orchestration_name TEXT NOT NULL,
                orchestration_version TEXT,
                current_execution_id INTEGER NOT NULL DEFAULT 1,
                parent_instance_id TEXT,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                instance_id TEXT NOT NULL,
                execution_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'Running',
                output TEXT,
                started_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                completed_at INTEGER,
                PRIMARY KEY (instance_id, execution_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                execution_id INTEGER NOT NULL,
                event_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (instance_id, execution_id, event_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                work_item TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT,
                locked_until INTEGER,
                attempt_count INTEGER NOT NULL DEFAULT 0 CHECK(attempt_count >= 0)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS worker_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_item TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT,
                locked_until INTEGER,
                attempt_count INTEGER NOT NULL DEFAULT 0 CHECK(attempt_count >= 0),
                instance_id TEXT,
                execution_id INTEGER,
                activity_id INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instance_locks (
                instance_id TEXT PRIMARY KEY,
                lock_token TEXT NOT NULL,
                locked_until INTEGER NOT NULL,
                locked_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orch_visible ON orchestrator_queue(visible_at, lock_token)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orch_instance ON orchestrator_queue(instance_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orch_lock ON orchestrator_queue(lock_token)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_worker_available ON worker_queue(lock_token, id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    fn decode_events(operation: &str, rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<Event>, ProviderError> {
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event_data: String = row
                .try_get("event_data")
                .map_err(|e| ProviderError::permanent(operation, format!("Failed to get event_data: {e}")))?;
            let event: Event = serde_json::from_str(&event_data)
                .map_err(|e| ProviderError::permanent(operation, format!("Failed to deserialize event: {e}")))?;
            events.push(event);
        }
        Ok(events)
    }

    async fn read_history_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query(
            r#"
            SELECT event_data
            FROM history
            WHERE instance_id = ? AND execution_id = ?
            ORDER BY event_id
            "#,
        )
        .bind(instance)
        .bind(execution_id as i64)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;
        Self::decode_events("fetch_orchestration_item", rows)
    }

    async fn append_history_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &str,
        execution_id: u64,
        events: &[Event],
    ) -> Result<(), ProviderError> {
        // Event ids come from the runtime, never from the store
        if events.iter().any(|e| e.event_id() == 0) {
            return Err(ProviderError::permanent(
                "ack_orchestration_item",
                "event_id must be set by runtime",
            ));
        }

        for event in events {
            let event_data = serde_json::to_string(event)?;
            sqlx::query(
                r#"
                INSERT INTO history (instance_id, execution_id, event_id, event_type, event_data)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(instance)
            .bind(execution_id as i64)
            .bind(event.event_id() as i64)
            .bind(event.type_name())
            .bind(event_data)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }
        Ok(())
    }

    async fn insert_orchestrator_item_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        item: &WorkItem,
        visible_at: i64,
    ) -> Result<(), ProviderError> {
        let instance = item
            .orchestrator_instance()
            .ok_or_else(|| ProviderError::permanent(operation, "Invalid work item type"))?;
        let work_item = serde_json::to_string(item)?;
        sqlx::query("INSERT INTO orchestrator_queue (instance_id, work_item, visible_at) VALUES (?, ?, ?)")
            .bind(instance)
            .bind(work_item)
            .bind(visible_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(())
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Provider for SqliteProvider {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(OrchestrationItem, String)>, ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;
        let now_ms = Self::now_millis();

        // Oldest visible message whose instance is not locked (or whose lock expired)
        let row = sqlx::query(
            r#"
            SELECT q.instance_id
            FROM orchestrator_queue q
            LEFT JOIN instance_locks il ON q.instance_id = il.instance_id
            WHERE q.visible_at <= ?1
              AND (il.instance_id IS NULL OR il.locked_until <= ?1)
            ORDER BY q.id
            LIMIT 1
            "#,
        )
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(None);
        };
        let instance_id: String = row.try_get("instance_id").map_err(|e| {
            ProviderError::permanent("fetch_orchestration_item", format!("Failed to get instance_id: {e}"))
        })?;

        let lock_token = Self::generate_lock_token();
        let locked_until = Self::timestamp_after(lock_timeout);

        let locked = sqlx::query(
            r#"
            INSERT INTO instance_locks (instance_id, lock_token, locked_until, locked_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(instance_id) DO UPDATE
            SET lock_token = ?2, locked_until = ?3, locked_at = ?4
            WHERE locked_until <= ?4
            "#,
        )
        .bind(&instance_id)
        .bind(&lock_token)
        .bind(locked_until)
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        if locked.rows_affected() == 0 {
            debug!(target: "durable_research::providers::sqlite", instance = %instance_id, "Instance already locked");
            tx.rollback().await.ok();
            return Ok(None);
        }

        // Mark every visible message, including ones left behind by an expired lock
        sqlx::query(
            r#"
            UPDATE orchestrator_queue
            SET lock_token = ?1, attempt_count = attempt_count + 1
            WHERE instance_id = ?2 AND visible_at <= ?3
            "#,
        )
        .bind(&lock_token)
        .bind(&instance_id)
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        let rows = sqlx::query("SELECT work_item FROM orchestrator_queue WHERE lock_token = ?1 ORDER BY id")
            .bind(&lock_token)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        let mut messages = Vec::with_capacity(rows.len());
        for r in rows {
            let raw: String = r.try_get("work_item").map_err(|e| {
                ProviderError::permanent("fetch_orchestration_item", format!("Failed to get work_item: {e}"))
            })?;
            messages.push(serde_json::from_str::<WorkItem>(&raw)?);
        }

        let instance_row = sqlx::query(
            r#"
            SELECT orchestration_name, orchestration_version, current_execution_id
            FROM instances
            WHERE instance_id = ?1
            "#,
        )
        .bind(&instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        let (orchestration_name, version, execution_id, history) = match instance_row {
            Some(info) => {
                let name: String = info.try_get("orchestration_name").map_err(|e| {
                    ProviderError::permanent(
                        "fetch_orchestration_item",
                        format!("Failed to get orchestration_name: {e}"),
                    )
                })?;
                let version: Option<String> = info.try_get("orchestration_version").ok().flatten();
                let exec_id: i64 = info.try_get("current_execution_id").map_err(|e| {
                    ProviderError::permanent(
                        "fetch_orchestration_item",
                        format!("Failed to get current_execution_id: {e}"),
                    )
                })?;
                let history = Self::read_history_in_tx(&mut tx, &instance_id, exec_id as u64).await?;
                (name, version, exec_id as u64, history)
            }
            None => {
                // Brand new instance; the runtime resolves the version
                let (name, version) = messages
                    .iter()
                    .find_map(|m| match m {
                        WorkItem::StartOrchestration {
                            orchestration, version, ..
                        }
                        | WorkItem::ContinueAsNew {
                            orchestration, version, ..
                        } => Some((orchestration.clone(), version.clone())),
                        _ => None,
                    })
                    .unwrap_or_default();
                (name, version, 1u64, Vec::new())
            }
        };

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        debug!(
            target: "durable_research::providers::sqlite",
            instance = %instance_id,
            messages = messages.len(),
            history_len = history.len(),
            "Fetched orchestration item"
        );

        Ok(Some((
            OrchestrationItem {
                instance: instance_id,
                orchestration_name,
                execution_id,
                version,
                history,
                messages,
            },
            lock_token,
        )))
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        let instance_id: String = sqlx::query_scalar("SELECT instance_id FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "Invalid lock token"))?;

        // Only the messages this turn saw; later arrivals stay for the next turn
        sqlx::query("DELETE FROM orchestrator_queue WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        if let Some(name) = &metadata.orchestration_name {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO instances
                (instance_id, orchestration_name, orchestration_version, current_execution_id, parent_instance_id)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&instance_id)
            .bind(name)
            .bind(&metadata.orchestration_version)
            .bind(execution_id as i64)
            .bind(&metadata.parent_instance_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

            // A continue-as-new may re-resolve the version
            sqlx::query(
                r#"
                UPDATE instances
                SET orchestration_name = ?, orchestration_version = COALESCE(?, orchestration_version)
                WHERE instance_id = ?
                "#,
            )
            .bind(name)
            .bind(&metadata.orchestration_version)
            .bind(&instance_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }

        if !history_delta.is_empty() || metadata.status.is_some() {
            sqlx::query("INSERT OR IGNORE INTO executions (instance_id, execution_id, status) VALUES (?, ?, 'Running')")
                .bind(&instance_id)
                .bind(execution_id as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

            sqlx::query("UPDATE instances SET current_execution_id = MAX(current_execution_id, ?) WHERE instance_id = ?")
                .bind(execution_id as i64)
                .bind(&instance_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }

        Self::append_history_in_tx(&mut tx, &instance_id, execution_id, &history_delta).await?;

        if let Some(status) = metadata.status {
            let completed_at = status.is_terminal().then(Self::now_millis);
            sqlx::query(
                r#"
                UPDATE executions
                SET status = ?, output = ?, completed_at = ?
                WHERE instance_id = ? AND execution_id = ?
                "#,
            )
            .bind(status.as_str())
            .bind(&metadata.output)
            .bind(completed_at)
            .bind(&instance_id)
            .bind(execution_id as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }

        if let Some(before) = metadata.prune_history_before {
            let pruned = sqlx::query("DELETE FROM history WHERE instance_id = ? AND execution_id < ?")
                .bind(&instance_id)
                .bind(before as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
            debug!(
                target: "durable_research::providers::sqlite",
                instance = %instance_id,
                before_execution = before,
                events = pruned.rows_affected(),
                "Pruned history of earlier executions"
            );
        }

        let now_ms = Self::now_millis();
        for item in &worker_items {
            let (instance, exec_id, activity_id) = match item {
                WorkItem::ActivityExecute {
                    instance,
                    execution_id,
                    id,
                    ..
                } => (Some(instance.as_str()), Some(*execution_id as i64), Some(*id as i64)),
                _ => (None, None, None),
            };
            let work_item = serde_json::to_string(item)?;
            sqlx::query(
                r#"
                INSERT INTO worker_queue (work_item, visible_at, instance_id, execution_id, activity_id)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(work_item)
            .bind(now_ms)
            .bind(instance)
            .bind(exec_id)
            .bind(activity_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }

        for item in &orchestrator_items {
            Self::insert_orchestrator_item_in_tx(&mut tx, "ack_orchestration_item", item, now_ms).await?;
        }

        let lock_valid: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM instance_locks WHERE instance_id = ? AND lock_token = ? AND locked_until > ?",
        )
        .bind(&instance_id)
        .bind(lock_token)
        .bind(Self::now_millis())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        if lock_valid == 0 {
            tracing::warn!(
                target: "durable_research::providers::sqlite",
                instance = %instance_id,
                "Instance lock expired, aborting ack"
            );
            tx.rollback().await.ok();
            return Err(ProviderError::permanent("ack_orchestration_item", "Instance lock expired"));
        }

        sqlx::query("DELETE FROM instance_locks WHERE instance_id = ? AND lock_token = ?")
            .bind(&instance_id)
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        debug!(
            target: "durable_research::providers::sqlite",
            instance = %instance_id,
            execution_id,
            history_delta = history_delta.len(),
            worker_items = worker_items.len(),
            orchestrator_items = orchestrator_items.len(),
            "Acknowledged orchestration item and released lock"
        );
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;

        let instance_id: Option<String> = sqlx::query_scalar("SELECT instance_id FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;
        let Some(instance_id) = instance_id else {
            return Err(ProviderError::permanent("abandon_orchestration_item", "Invalid lock token"));
        };

        sqlx::query("DELETE FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;

        sqlx::query("UPDATE orchestrator_queue SET lock_token = NULL WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;

        if let Some(delay) = delay {
            let now_ms = Self::now_millis();
            sqlx::query("UPDATE orchestrator_queue SET visible_at = ? WHERE instance_id = ? AND visible_at <= ?")
                .bind(Self::timestamp_after(delay))
                .bind(&instance_id)
                .bind(now_ms)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;
        Ok(())
    }

    async fn enqueue_for_orchestrator(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError> {
        let visible_at = delay.map(Self::timestamp_after).unwrap_or_else(Self::now_millis);
        tracing::debug!(
            target: "durable_research::providers::sqlite",
            kind = item.kind(),
            instance = ?item.orchestrator_instance(),
            ?delay,
            "enqueue_for_orchestrator"
        );
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("enqueue_for_orchestrator", e))?;
        Self::insert_orchestrator_item_in_tx(&mut tx, "enqueue_for_orchestrator", &item, visible_at).await?;
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("enqueue_for_orchestrator", e))?;
        Ok(())
    }

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_work_item", e))?;

        let now_ms = Self::now_millis();
        let next_item = sqlx::query(
            r#"
            SELECT id, work_item FROM worker_queue
            WHERE visible_at <= ?1
              AND (lock_token IS NULL OR locked_until <= ?1)
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_work_item", e))?;

        let Some(next_item) = next_item else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let id: i64 = next_item
            .try_get("id")
            .map_err(|e| ProviderError::permanent("fetch_work_item", format!("Failed to get id: {e}")))?;
        let raw: String = next_item
            .try_get("work_item")
            .map_err(|e| ProviderError::permanent("fetch_work_item", format!("Failed to get work_item: {e}")))?;
        let work_item: WorkItem = serde_json::from_str(&raw)?;

        let lock_token = Self::generate_lock_token();
        sqlx::query(
            r#"
            UPDATE worker_queue
            SET lock_token = ?1, locked_until = ?2, attempt_count = attempt_count + 1
            WHERE id = ?3
            "#,
        )
        .bind(&lock_token)
        .bind(Self::timestamp_after(lock_timeout))
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_work_item", e))?;

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_work_item", e))?;

        Ok(Some((work_item, lock_token)))
    }

    async fn ack_work_item(&self, token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError> {
        if let Some(c) = &completion
            && !matches!(c, WorkItem::ActivityCompleted { .. } | WorkItem::ActivityFailed { .. })
        {
            return Err(ProviderError::permanent(
                "ack_work_item",
                "Invalid completion type for worker ack",
            ));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_work_item", e))?;

        let deleted = sqlx::query("DELETE FROM worker_queue WHERE lock_token = ?")
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_work_item", e))?;
        if deleted.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(ProviderError::permanent("ack_work_item", "Invalid lock token or already acked"));
        }

        if let Some(completion) = &completion {
            Self::insert_orchestrator_item_in_tx(&mut tx, "ack_work_item", completion, Self::now_millis()).await?;
        }

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_work_item", e))?;
        Ok(())
    }

    async fn abandon_work_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let visible_at = delay.map(Self::timestamp_after).unwrap_or_else(Self::now_millis);
        let result = sqlx::query(
            r#"
            UPDATE worker_queue
            SET lock_token = NULL, locked_until = NULL, visible_at = ?1
            WHERE lock_token = ?2
            "#,
        )
        .bind(visible_at)
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("abandon_work_item", e))?;

        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "abandon_work_item",
                "Invalid lock token or already acked",
            ));
        }
        Ok(())
    }

    async fn renew_work_item_lock(&self, token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let result = sqlx::query(
            r#"
            UPDATE worker_queue
            SET locked_until = ?1
            WHERE lock_token = ?2
              AND locked_until > ?3
            "#,
        )
        .bind(Self::timestamp_after(extend_for))
        .bind(token)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("renew_work_item_lock", e))?;

        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "renew_work_item_lock",
                "Lock token invalid or expired",
            ));
        }
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let execution_id: Option<i64> =
            sqlx::query_scalar("SELECT MAX(execution_id) FROM executions WHERE instance_id = ?")
                .bind(instance)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("read", e))?;
        match execution_id {
            Some(id) => self.read_with_execution(instance, id as u64).await,
            None => Ok(Vec::new()),
        }
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query(
            r#"
            SELECT event_data
            FROM history
            WHERE instance_id = ? AND execution_id = ?
            ORDER BY event_id
            "#,
        )
        .bind(instance)
        .bind(execution_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("read_with_execution", e))?;
        Self::decode_events("read_with_execution", rows)
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        sqlx::query_scalar("SELECT instance_id FROM instances ORDER BY created_at, instance_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT execution_id FROM executions WHERE instance_id = ? ORDER BY execution_id")
                .bind(instance)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("list_executions", e))?;
        Ok(ids.into_iter().map(|id| id as u64).collect())
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        let row = sqlx::query(
            r#"
            SELECT
                i.orchestration_name,
                i.orchestration_version,
                i.current_execution_id,
                i.parent_instance_id,
                e.status,
                e.output
            FROM instances i
            LEFT JOIN executions e ON i.instance_id = e.instance_id AND i.current_execution_id = e.execution_id
            WHERE i.instance_id = ?
            "#,
        )
        .bind(instance)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("get_instance_info", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let orchestration_name: String = row
            .try_get("orchestration_name")
            .map_err(|e| Self::sqlx_to_provider_error("get_instance_info", e))?;
        let current_execution_id: i64 = row
            .try_get("current_execution_id")
            .map_err(|e| Self::sqlx_to_provider_error("get_instance_info", e))?;
        let status: Option<String> = row.try_get("status").ok().flatten();
        let status = match status {
            Some(s) => s.parse::<ExecutionStatus>()?,
            None => ExecutionStatus::Running,
        };

        Ok(Some(InstanceInfo {
            instance_id: instance.to_string(),
            orchestration_name,
            orchestration_version: row.try_get("orchestration_version").ok().flatten(),
            current_execution_id: current_execution_id as u64,
            status,
            output: row.try_get("output").ok().flatten(),
            parent_instance_id: row.try_get("parent_instance_id").ok().flatten(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventKind, RetryPolicy};

    async fn create_test_store() -> SqliteProvider {
        SqliteProvider::new_in_memory()
            .await
            .expect("Failed to create test store")
    }

    const LOCK: Duration = Duration::from_secs(30);

    fn start_item(instance: &str) -> WorkItem {
        WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: "TestOrch".to_string(),
            input: "{}".to_string(),
            version: Some("1.0.0".to_string()),
            parent_instance: None,
            parent_id: None,
            parent_execution_id: None,
        }
    }

    fn started(instance: &str, execution_id: u64, input: &str) -> Event {
        Event::with_event_id(
            1,
            instance,
            execution_id,
            None,
            EventKind::OrchestrationStarted {
                name: "TestOrch".to_string(),
                version: "1.0.0".to_string(),
                input: input.to_string(),
                parent_instance: None,
                parent_id: None,
                parent_execution_id: None,
            },
        )
    }

    fn first_turn() -> ExecutionMetadata {
        ExecutionMetadata {
            status: Some(ExecutionStatus::Running),
            orchestration_name: Some("TestOrch".into()),
            orchestration_version: Some("1.0.0".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_basic_enqueue_dequeue() {
        let store = create_test_store().await;
        store.enqueue_for_orchestrator(start_item("test-1"), None).await.unwrap();

        let (item, lock_token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert_eq!(item.instance, "test-1");
        assert_eq!(item.orchestration_name, "TestOrch");
        assert_eq!(item.version.as_deref(), Some("1.0.0"));
        assert_eq!(item.messages.len(), 1);
        assert!(item.history.is_empty());

        store
            .ack_orchestration_item(&lock_token, 1, vec![started("test-1", 1, "{}")], vec![], vec![], first_turn())
            .await
            .unwrap();

        assert!(store.fetch_orchestration_item(LOCK).await.unwrap().is_none());
        assert_eq!(store.read("test-1").await.unwrap().len(), 1);
        assert_eq!(store.list_instances().await.unwrap(), vec!["test-1".to_string()]);

        let info = store.get_instance_info("test-1").await.unwrap().unwrap();
        assert_eq!(info.orchestration_name, "TestOrch");
        assert_eq!(info.status, ExecutionStatus::Running);
        assert!(store.get_instance_info("missing").await.unwrap().is_none());
        assert!(store.read("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_instance_lock_blocks_second_fetch() {
        let store = create_test_store().await;
        store.enqueue_for_orchestrator(start_item("a"), None).await.unwrap();
        let (_, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();

        store
            .enqueue_for_orchestrator(
                WorkItem::CancelInstance {
                    instance: "a".into(),
                    reason: "stop".into(),
                },
                None,
            )
            .await
            .unwrap();
        assert!(store.fetch_orchestration_item(LOCK).await.unwrap().is_none());

        store
            .ack_orchestration_item(&token, 1, vec![started("a", 1, "{}")], vec![], vec![], first_turn())
            .await
            .unwrap();
        let (item, _) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert!(matches!(item.messages[..], [WorkItem::CancelInstance { .. }]));
        assert_eq!(item.history.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_lock_rejects_ack() {
        let store = create_test_store().await;
        store.enqueue_for_orchestrator(start_item("a"), None).await.unwrap();
        let (_, token) = store
            .fetch_orchestration_item(Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = store
            .ack_orchestration_item(&token, 1, vec![started("a", 1, "{}")], vec![], vec![], first_turn())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        // Nothing from the rejected ack was persisted
        assert!(store.read("a").await.unwrap().is_empty());

        let (item, _) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert_eq!(item.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_abandon_with_delay() {
        let store = create_test_store().await;
        store.enqueue_for_orchestrator(start_item("a"), None).await.unwrap();
        let (_, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        store
            .abandon_orchestration_item(&token, Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(store.fetch_orchestration_item(LOCK).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(store.fetch_orchestration_item(LOCK).await.unwrap().is_some());
        assert!(store.abandon_orchestration_item("bogus", None).await.is_err());
    }

    #[tokio::test]
    async fn test_worker_queue_operations() {
        let store = create_test_store().await;
        store.enqueue_for_orchestrator(start_item("a"), None).await.unwrap();
        let (_, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        let exec = WorkItem::ActivityExecute {
            instance: "a".into(),
            execution_id: 1,
            id: 2,
            orchestration: "TestOrch".into(),
            name: "Work".into(),
            input: "x".into(),
            retry: RetryPolicy::default(),
        };
        store
            .ack_orchestration_item(&token, 1, vec![started("a", 1, "{}")], vec![exec.clone()], vec![], first_turn())
            .await
            .unwrap();

        let (item, wtoken) = store.fetch_work_item(LOCK).await.unwrap().unwrap();
        assert_eq!(item, exec);
        assert!(store.fetch_work_item(LOCK).await.unwrap().is_none());

        store.abandon_work_item(&wtoken, None).await.unwrap();
        let (_, wtoken) = store.fetch_work_item(LOCK).await.unwrap().unwrap();
        store.renew_work_item_lock(&wtoken, LOCK).await.unwrap();

        store
            .ack_work_item(
                &wtoken,
                Some(WorkItem::ActivityCompleted {
                    instance: "a".into(),
                    execution_id: 1,
                    id: 2,
                    result: "done".into(),
                    attempts: 2,
                }),
            )
            .await
            .unwrap();
        assert!(store.ack_work_item(&wtoken, None).await.is_err());
        assert!(store.renew_work_item_lock(&wtoken, LOCK).await.is_err());

        let (item, _) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert!(matches!(item.messages[..], [WorkItem::ActivityCompleted { attempts: 2, .. }]));
    }

    #[tokio::test]
    async fn test_multi_execution_support() {
        let store = create_test_store().await;
        store.enqueue_for_orchestrator(start_item("a"), None).await.unwrap();
        let (_, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        let can = Event::with_event_id(
            2,
            "a",
            1,
            None,
            EventKind::OrchestrationContinuedAsNew { input: "2".into() },
        );
        store
            .ack_orchestration_item(
                &token,
                1,
                vec![started("a", 1, "1"), can],
                vec![],
                vec![WorkItem::ContinueAsNew {
                    instance: "a".into(),
                    orchestration: "TestOrch".into(),
                    input: "2".into(),
                    version: None,
                }],
                ExecutionMetadata {
                    status: Some(ExecutionStatus::ContinuedAsNew),
                    ..first_turn()
                },
            )
            .await
            .unwrap();

        let (item, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert_eq!(item.execution_id, 1);
        assert!(matches!(item.messages[..], [WorkItem::ContinueAsNew { .. }]));
        store
            .ack_orchestration_item(
                &token,
                2,
                vec![started("a", 2, "2")],
                vec![],
                vec![],
                ExecutionMetadata {
                    status: Some(ExecutionStatus::Running),
                    orchestration_name: Some("TestOrch".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(store.list_executions("a").await.unwrap(), vec![1, 2]);
        assert_eq!(store.read_with_execution("a", 1).await.unwrap().len(), 2);
        let latest = store.read("a").await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].execution_id, 2);

        let info = store.get_instance_info("a").await.unwrap().unwrap();
        assert_eq!(info.current_execution_id, 2);
        // Version survives an ack that does not re-resolve it
        assert_eq!(info.orchestration_version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn test_prune_keeps_execution_rows() {
        let store = create_test_store().await;
        store.enqueue_for_orchestrator(start_item("a"), None).await.unwrap();
        let (_, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        store
            .ack_orchestration_item(
                &token,
                1,
                vec![started("a", 1, "1")],
                vec![],
                vec![WorkItem::ContinueAsNew {
                    instance: "a".into(),
                    orchestration: "TestOrch".into(),
                    input: "2".into(),
                    version: None,
                }],
                ExecutionMetadata {
                    status: Some(ExecutionStatus::ContinuedAsNew),
                    ..first_turn()
                },
            )
            .await
            .unwrap();
        let (_, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        store
            .ack_orchestration_item(
                &token,
                2,
                vec![started("a", 2, "2")],
                vec![],
                vec![],
                ExecutionMetadata {
                    status: Some(ExecutionStatus::Running),
                    prune_history_before: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(store.list_executions("a").await.unwrap(), vec![1, 2]);
        assert!(store.read_with_execution("a", 1).await.unwrap().is_empty());
        assert_eq!(store.read("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("store.db").display());

        {
            let store = SqliteProvider::new(&url, None).await.unwrap();
            store.enqueue_for_orchestrator(start_item("a"), None).await.unwrap();
            let (_, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
            store
                .ack_orchestration_item(&token, 1, vec![started("a", 1, "{}")], vec![], vec![], first_turn())
                .await
                .unwrap();
            store.get_pool().close().await;
        }

        let reopened = SqliteProvider::new(&url, None).await.unwrap();
        assert_eq!(reopened.read("a").await.unwrap().len(), 1);
        assert_eq!(reopened.list_executions("a").await.unwrap(), vec![1]);
    }
}
