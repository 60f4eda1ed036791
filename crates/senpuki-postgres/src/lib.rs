//! PostgreSQL implementation of [`senpuki::StorageBackend`].
//!
//! Schema (created idempotently by [`PostgresBackend::init_db`]):
//!
//! ```text
//! executions(id, root_step_name, arguments, state, created_at, updated_at,
//!            completed_at, result, error)
//! execution_counters(execution_id, name, value)
//! execution_state(execution_id, key, value)
//! tasks(id, execution_id, parent_task_id, kind, step_name, arguments, state,
//!       attempt, max_attempts, scheduled_for, expires_at, lease_expires_at,
//!       last_heartbeat_at, worker_id, queue, priority, tags, idempotency_key,
//!       cache_key, concurrency_group, concurrency_limit, result, error,
//!       progress, created_at, updated_at)
//! dead_tasks(id, execution_id, parent_task_id, kind, step_name, arguments,
//!            attempt, max_attempts, queue, priority, tags, idempotency_key,
//!            cache_key, concurrency_group, concurrency_limit, progress,
//!            final_error, dead_lettered_at, created_at)
//! cache(key, value, created_at, ttl_seconds)
//! signals(id, execution_id, name, payload, created_at)
//! ```
//!
//! `claim_next_task` fetches a batch of eligible rows with
//! `FOR UPDATE SKIP LOCKED` inside one transaction, filters for tag
//! superset and concurrency-group admission in Rust (mirroring
//! `senpuki-testing::MemoryBackend`'s candidate selection), then updates
//! and commits the single winner. Competing claimers never block on each
//! other's candidate rows.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use senpuki::{
    CacheEntry, ClaimFilter, DeadLetter, Execution, ExecutionId, ExecutionState, ExecutionView,
    FailDisposition, LeaseRenewal, Payload, ProgressStep, SenpukiError, StorageBackend, Task,
    TaskId, TaskKind, TaskState,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

fn db_err(e: sqlx::Error) -> SenpukiError {
    SenpukiError::BackendUnavailable(e.to_string())
}

fn ser_err(e: impl std::fmt::Display) -> SenpukiError {
    SenpukiError::SerializationFailed(e.to_string())
}

fn encode_tags(tags: &HashSet<String>) -> serde_json::Value {
    serde_json::Value::Array(tags.iter().cloned().map(serde_json::Value::String).collect())
}

fn decode_tags(raw: &serde_json::Value) -> Result<HashSet<String>, SenpukiError> {
    let arr = raw.as_array().ok_or_else(|| ser_err("tags column is not a JSON array"))?;
    arr.iter()
        .map(|v| v.as_str().map(str::to_string).ok_or_else(|| ser_err("tag entry is not a string")))
        .collect()
}

fn encode_progress(progress: &[ProgressStep]) -> Result<serde_json::Value, SenpukiError> {
    serde_json::to_value(progress).map_err(ser_err)
}

fn decode_progress(raw: &serde_json::Value) -> Result<Vec<ProgressStep>, SenpukiError> {
    serde_json::from_value(raw.clone()).map_err(ser_err)
}

fn task_from_row(row: &sqlx::postgres::PgRow) -> Result<Task, SenpukiError> {
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let state: String = row.try_get("state").map_err(db_err)?;
    let tags: serde_json::Value = row.try_get("tags").map_err(db_err)?;
    let progress: serde_json::Value = row.try_get("progress").map_err(db_err)?;
    let result: Option<Vec<u8>> = row.try_get("result").map_err(db_err)?;
    let arguments: Vec<u8> = row.try_get("arguments").map_err(db_err)?;

    Ok(Task {
        id: row.try_get("id").map_err(db_err)?,
        execution_id: row.try_get("execution_id").map_err(db_err)?,
        parent_task_id: row.try_get("parent_task_id").map_err(db_err)?,
        kind: TaskKind::from_str(&kind)?,
        step_name: row.try_get("step_name").map_err(db_err)?,
        arguments: Payload(arguments),
        state: TaskState::from_str(&state)?,
        attempt: row.try_get::<i32, _>("attempt").map_err(db_err)? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(db_err)? as u32,
        scheduled_for: row.try_get("scheduled_for").map_err(db_err)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(db_err)?,
        last_heartbeat_at: row.try_get("last_heartbeat_at").map_err(db_err)?,
        worker_id: row.try_get("worker_id").map_err(db_err)?,
        queue: row.try_get("queue").map_err(db_err)?,
        priority: row.try_get("priority").map_err(db_err)?,
        tags: decode_tags(&tags)?,
        idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
        cache_key: row.try_get("cache_key").map_err(db_err)?,
        concurrency_group: row.try_get("concurrency_group").map_err(db_err)?,
        concurrency_limit: row
            .try_get::<Option<i32>, _>("concurrency_limit")
            .map_err(db_err)?
            .map(|v| v as u32),
        result: result.map(Payload),
        error: row.try_get("error").map_err(db_err)?,
        progress: decode_progress(&progress)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn execution_from_row(row: &sqlx::postgres::PgRow) -> Result<Execution, SenpukiError> {
    let state: String = row.try_get("state").map_err(db_err)?;
    let arguments: Vec<u8> = row.try_get("arguments").map_err(db_err)?;
    let result: Option<Vec<u8>> = row.try_get("result").map_err(db_err)?;
    Ok(Execution {
        id: row.try_get("id").map_err(db_err)?,
        root_step_name: row.try_get("root_step_name").map_err(db_err)?,
        arguments: Payload(arguments),
        state: ExecutionState::from_str(&state)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        result: result.map(Payload),
        error: row.try_get("error").map_err(db_err)?,
        counters: HashMap::new(),
        custom_state: HashMap::new(),
    })
}

fn dead_letter_from_row(row: &sqlx::postgres::PgRow) -> Result<DeadLetter, SenpukiError> {
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let tags: serde_json::Value = row.try_get("tags").map_err(db_err)?;
    let progress: serde_json::Value = row.try_get("progress").map_err(db_err)?;
    let arguments: Vec<u8> = row.try_get("arguments").map_err(db_err)?;
    let id: TaskId = row.try_get("id").map_err(db_err)?;
    let final_error: String = row.try_get("final_error").map_err(db_err)?;

    let task = Task {
        id,
        execution_id: row.try_get("execution_id").map_err(db_err)?,
        parent_task_id: row.try_get("parent_task_id").map_err(db_err)?,
        kind: TaskKind::from_str(&kind)?,
        step_name: row.try_get("step_name").map_err(db_err)?,
        arguments: Payload(arguments),
        state: TaskState::Dead,
        attempt: row.try_get::<i32, _>("attempt").map_err(db_err)? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(db_err)? as u32,
        scheduled_for: row.try_get("dead_lettered_at").map_err(db_err)?,
        expires_at: None,
        lease_expires_at: None,
        last_heartbeat_at: None,
        worker_id: None,
        queue: row.try_get("queue").map_err(db_err)?,
        priority: row.try_get("priority").map_err(db_err)?,
        tags: decode_tags(&tags)?,
        idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
        cache_key: row.try_get("cache_key").map_err(db_err)?,
        concurrency_group: row.try_get("concurrency_group").map_err(db_err)?,
        concurrency_limit: row
            .try_get::<Option<i32>, _>("concurrency_limit")
            .map_err(db_err)?
            .map(|v| v as u32),
        result: None,
        error: Some(final_error.clone()),
        progress: decode_progress(&progress)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("dead_lettered_at").map_err(db_err)?,
    };

    Ok(DeadLetter {
        id,
        task,
        final_error,
        dead_lettered_at: row.try_get("dead_lettered_at").map_err(db_err)?,
    })
}

/// A PostgreSQL-backed [`StorageBackend`].
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub async fn connect(database_url: &str) -> Result<Self, SenpukiError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    async fn init_db(&self) -> Result<(), SenpukiError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id UUID PRIMARY KEY,
                root_step_name TEXT NOT NULL,
                arguments BYTEA NOT NULL,
                state TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                result BYTEA,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS executions_state_created_at_idx
                ON executions (state, created_at);

            CREATE TABLE IF NOT EXISTS execution_counters (
                execution_id UUID NOT NULL REFERENCES executions (id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                value BIGINT NOT NULL,
                PRIMARY KEY (execution_id, name)
            );

            CREATE TABLE IF NOT EXISTS execution_state (
                execution_id UUID NOT NULL REFERENCES executions (id) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value BYTEA NOT NULL,
                PRIMARY KEY (execution_id, key)
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id UUID PRIMARY KEY,
                execution_id UUID NOT NULL REFERENCES executions (id) ON DELETE CASCADE,
                parent_task_id UUID,
                kind TEXT NOT NULL,
                step_name TEXT NOT NULL,
                arguments BYTEA NOT NULL,
                state TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                max_attempts INTEGER NOT NULL,
                scheduled_for TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ,
                lease_expires_at TIMESTAMPTZ,
                last_heartbeat_at TIMESTAMPTZ,
                worker_id TEXT,
                queue TEXT NOT NULL,
                priority INTEGER NOT NULL,
                tags JSONB NOT NULL,
                idempotency_key TEXT,
                cache_key TEXT,
                concurrency_group TEXT,
                concurrency_limit INTEGER,
                result BYTEA,
                error TEXT,
                progress JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );

            CREATE INDEX IF NOT EXISTS tasks_claim_idx
                ON tasks (state, queue, priority DESC, scheduled_for ASC, created_at ASC);
            CREATE INDEX IF NOT EXISTS tasks_concurrency_group_idx
                ON tasks (concurrency_group, state, lease_expires_at);
            CREATE INDEX IF NOT EXISTS tasks_execution_id_idx
                ON tasks (execution_id);

            CREATE TABLE IF NOT EXISTS dead_tasks (
                id UUID PRIMARY KEY,
                execution_id UUID NOT NULL,
                parent_task_id UUID,
                kind TEXT NOT NULL,
                step_name TEXT NOT NULL,
                arguments BYTEA NOT NULL,
                attempt INTEGER NOT NULL,
                max_attempts INTEGER NOT NULL,
                queue TEXT NOT NULL,
                priority INTEGER NOT NULL,
                tags JSONB NOT NULL,
                idempotency_key TEXT,
                cache_key TEXT,
                concurrency_group TEXT,
                concurrency_limit INTEGER,
                progress JSONB NOT NULL,
                final_error TEXT NOT NULL,
                dead_lettered_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE INDEX IF NOT EXISTS dead_tasks_created_at_idx
                ON dead_tasks (created_at);

            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                ttl_seconds BIGINT
            );

            CREATE TABLE IF NOT EXISTS signals (
                id BIGSERIAL PRIMARY KEY,
                execution_id UUID NOT NULL REFERENCES executions (id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                payload BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE INDEX IF NOT EXISTS signals_lookup_idx
                ON signals (execution_id, name, id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        tracing::debug!("senpuki postgres schema ready");
        Ok(())
    }

    async fn create_execution_with_root_task(
        &self,
        execution: Execution,
        task: Task,
    ) -> Result<(), SenpukiError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            "INSERT INTO executions (id, root_step_name, arguments, state, created_at, updated_at, completed_at, result, error)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(execution.id)
        .bind(&execution.root_step_name)
        .bind(execution.arguments.as_bytes())
        .bind(execution.state.as_str())
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .bind(execution.completed_at)
        .bind(execution.result.as_ref().map(Payload::as_bytes))
        .bind(&execution.error)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        insert_task(&mut tx, &task).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn create_child_task(&self, task: Task) -> Result<(), SenpukiError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        insert_task(&mut tx, &task).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn claim_next_task(
        &self,
        worker_id: &str,
        filter: &ClaimFilter,
        lease_duration: ChronoDuration,
    ) -> Result<Option<Task>, SenpukiError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE scheduled_for <= $1 AND queue = ANY($2)
               AND (state = 'pending' OR (state = 'running' AND lease_expires_at <= $1))
             ORDER BY priority DESC, scheduled_for ASC, created_at ASC
             LIMIT 200
             FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .bind(&filter.queues)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            candidates.push(task_from_row(row)?);
        }
        candidates.retain(|t| filter.required_tags.is_subset(&t.tags));

        if candidates.is_empty() {
            tx.rollback().await.ok();
            return Ok(None);
        }

        let groups: Vec<String> = candidates
            .iter()
            .filter_map(|t| t.concurrency_group.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut running_counts: HashMap<String, u32> = HashMap::new();
        if !groups.is_empty() {
            let rows = sqlx::query(
                "SELECT concurrency_group, COUNT(*) AS cnt FROM tasks
                 WHERE state = 'running' AND lease_expires_at > $1 AND concurrency_group = ANY($2)
                 GROUP BY concurrency_group",
            )
            .bind(now)
            .bind(&groups)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;
            for row in rows {
                let group: String = row.try_get("concurrency_group").map_err(db_err)?;
                let cnt: i64 = row.try_get("cnt").map_err(db_err)?;
                running_counts.insert(group, cnt as u32);
            }
        }

        let winner = candidates.into_iter().find(|t| match (&t.concurrency_group, t.concurrency_limit) {
            (Some(group), Some(limit)) => running_counts.get(group).copied().unwrap_or(0) < limit,
            _ => true,
        });

        let Some(mut winner) = winner else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let new_lease = now + lease_duration;
        sqlx::query(
            "UPDATE tasks SET state = 'running', worker_id = $1, lease_expires_at = $2,
             last_heartbeat_at = $3, updated_at = $3 WHERE id = $4",
        )
        .bind(worker_id)
        .bind(new_lease)
        .bind(now)
        .bind(winner.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        winner.state = TaskState::Running;
        winner.worker_id = Some(worker_id.to_string());
        winner.lease_expires_at = Some(new_lease);
        winner.last_heartbeat_at = Some(now);
        winner.updated_at = now;
        tracing::debug!(task_id = %winner.id, worker_id, "claimed task");
        Ok(Some(winner))
    }

    async fn renew_lease(
        &self,
        task_id: TaskId,
        worker_id: &str,
        new_expiry: DateTime<Utc>,
    ) -> Result<LeaseRenewal, SenpukiError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE tasks SET lease_expires_at = $1, last_heartbeat_at = $2, updated_at = $2
             WHERE id = $3 AND worker_id = $4 AND state = 'running'
             AND (lease_expires_at IS NULL OR lease_expires_at > $2)",
        )
        .bind(new_expiry)
        .bind(now)
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(if result.rows_affected() == 1 {
            LeaseRenewal::Renewed
        } else {
            LeaseRenewal::Lost
        })
    }

    async fn complete_task(&self, task_id: TaskId, worker_id: &str, result: Payload) -> Result<(), SenpukiError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE tasks SET state = 'completed', result = $1, worker_id = NULL,
             lease_expires_at = NULL, updated_at = $2 WHERE id = $3 AND worker_id = $4",
        )
        .bind(result.as_bytes())
        .bind(now)
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: &str,
        disposition: FailDisposition,
    ) -> Result<(), SenpukiError> {
        let now = Utc::now();
        match disposition {
            FailDisposition::Retry { retry_at } => {
                sqlx::query(
                    "UPDATE tasks SET state = 'pending', attempt = attempt + 1, error = $1,
                     worker_id = NULL, lease_expires_at = NULL, scheduled_for = $2, updated_at = $3
                     WHERE id = $4 AND worker_id = $5",
                )
                .bind(error)
                .bind(retry_at)
                .bind(now)
                .bind(task_id)
                .bind(worker_id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
            }
            FailDisposition::Dead => {
                let mut tx = self.pool.begin().await.map_err(db_err)?;
                let row = sqlx::query("SELECT * FROM tasks WHERE id = $1 AND worker_id = $2")
                    .bind(task_id)
                    .bind(worker_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?;
                if let Some(row) = row {
                    let task = task_from_row(&row)?;
                    sqlx::query(
                        "INSERT INTO dead_tasks (id, execution_id, parent_task_id, kind, step_name,
                         arguments, attempt, max_attempts, queue, priority, tags, idempotency_key,
                         cache_key, concurrency_group, concurrency_limit, progress, final_error,
                         dead_lettered_at, created_at)
                         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)
                         ON CONFLICT (id) DO NOTHING",
                    )
                    .bind(task.id)
                    .bind(task.execution_id)
                    .bind(task.parent_task_id)
                    .bind(task.kind.as_str())
                    .bind(&task.step_name)
                    .bind(task.arguments.as_bytes())
                    .bind(task.attempt as i32)
                    .bind(task.max_attempts as i32)
                    .bind(&task.queue)
                    .bind(task.priority)
                    .bind(encode_tags(&task.tags))
                    .bind(&task.idempotency_key)
                    .bind(&task.cache_key)
                    .bind(&task.concurrency_group)
                    .bind(task.concurrency_limit.map(|v| v as i32))
                    .bind(encode_progress(&task.progress)?)
                    .bind(error)
                    .bind(now)
                    .bind(task.created_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;

                    sqlx::query(
                        "UPDATE tasks SET state = 'dead', error = $1, worker_id = NULL,
                         lease_expires_at = NULL, updated_at = $2 WHERE id = $3",
                    )
                    .bind(error)
                    .bind(now)
                    .bind(task_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                }
                tx.commit().await.map_err(db_err)?;
            }
        }
        Ok(())
    }

    async fn wake_task(&self, task_id: TaskId, scheduled_for: DateTime<Utc>) -> Result<(), SenpukiError> {
        sqlx::query(
            "UPDATE tasks SET state = 'pending', scheduled_for = $1, updated_at = $2
             WHERE id = $3 AND state != 'dead'",
        )
        .bind(scheduled_for)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn park_task(
        &self,
        task_id: TaskId,
        worker_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<(), SenpukiError> {
        sqlx::query(
            "UPDATE tasks SET state = 'pending', worker_id = NULL, lease_expires_at = NULL,
             scheduled_for = $1, updated_at = $2 WHERE id = $3 AND worker_id = $4",
        )
        .bind(scheduled_for)
        .bind(Utc::now())
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_task_progress(&self, task_id: TaskId, progress: Vec<ProgressStep>) -> Result<(), SenpukiError> {
        sqlx::query("UPDATE tasks SET progress = $1, updated_at = $2 WHERE id = $3")
            .bind(encode_progress(&progress)?)
            .bind(Utc::now())
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, SenpukiError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn update_task(&self, task: Task) -> Result<(), SenpukiError> {
        sqlx::query(
            "UPDATE tasks SET execution_id = $1, parent_task_id = $2, kind = $3, step_name = $4,
             arguments = $5, state = $6, attempt = $7, max_attempts = $8, scheduled_for = $9,
             expires_at = $10, lease_expires_at = $11, last_heartbeat_at = $12, worker_id = $13,
             queue = $14, priority = $15, tags = $16, idempotency_key = $17, cache_key = $18,
             concurrency_group = $19, concurrency_limit = $20, result = $21, error = $22,
             progress = $23, updated_at = $24 WHERE id = $25",
        )
        .bind(task.execution_id)
        .bind(task.parent_task_id)
        .bind(task.kind.as_str())
        .bind(&task.step_name)
        .bind(task.arguments.as_bytes())
        .bind(task.state.as_str())
        .bind(task.attempt as i32)
        .bind(task.max_attempts as i32)
        .bind(task.scheduled_for)
        .bind(task.expires_at)
        .bind(task.lease_expires_at)
        .bind(task.last_heartbeat_at)
        .bind(&task.worker_id)
        .bind(&task.queue)
        .bind(task.priority)
        .bind(encode_tags(&task.tags))
        .bind(&task.idempotency_key)
        .bind(&task.cache_key)
        .bind(&task.concurrency_group)
        .bind(task.concurrency_limit.map(|v| v as i32))
        .bind(task.result.as_ref().map(Payload::as_bytes))
        .bind(&task.error)
        .bind(encode_progress(&task.progress)?)
        .bind(Utc::now())
        .bind(task.id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_tasks(
        &self,
        execution_id: Option<ExecutionId>,
        state: Option<TaskState>,
        limit: usize,
    ) -> Result<Vec<Task>, SenpukiError> {
        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE ($1::UUID IS NULL OR execution_id = $1)
             AND ($2::TEXT IS NULL OR state = $2)
             ORDER BY created_at DESC LIMIT $3",
        )
        .bind(execution_id)
        .bind(state.map(TaskState::as_str))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn count_executions(&self, state: Option<ExecutionState>) -> Result<u64, SenpukiError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM executions WHERE $1::TEXT IS NULL OR state = $1")
            .bind(state.map(ExecutionState::as_str))
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let cnt: i64 = row.try_get("cnt").map_err(db_err)?;
        Ok(cnt as u64)
    }

    async fn list_executions(&self, state: Option<ExecutionState>, limit: usize) -> Result<Vec<Execution>, SenpukiError> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE ($1::TEXT IS NULL OR state = $1)
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(state.map(ExecutionState::as_str))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn count_dead_tasks(&self) -> Result<u64, SenpukiError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM dead_tasks")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let cnt: i64 = row.try_get("cnt").map_err(db_err)?;
        Ok(cnt as u64)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, SenpukiError> {
        let rows = sqlx::query("SELECT * FROM dead_tasks ORDER BY dead_lettered_at DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn get_dead_letter(&self, task_id: TaskId) -> Result<Option<DeadLetter>, SenpukiError> {
        let row = sqlx::query("SELECT * FROM dead_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(dead_letter_from_row).transpose()
    }

    async fn delete_dead_letter(&self, task_id: TaskId) -> Result<(), SenpukiError> {
        sqlx::query("DELETE FROM dead_tasks WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn replay_dead_letter(&self, task_id: TaskId, queue: Option<String>) -> Result<TaskId, SenpukiError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query("SELECT * FROM dead_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| SenpukiError::Other(anyhow::anyhow!("no dead letter with id {task_id}")))?;

        let dl = dead_letter_from_row(&row)?;
        let new_id = uuid::Uuid::new_v4();
        let now = Utc::now();
        let mut fresh = dl.task.clone();
        fresh.id = new_id;
        fresh.state = TaskState::Pending;
        fresh.attempt = 0;
        fresh.worker_id = None;
        fresh.lease_expires_at = None;
        fresh.last_heartbeat_at = None;
        fresh.error = None;
        fresh.result = None;
        fresh.scheduled_for = now;
        fresh.created_at = now;
        fresh.updated_at = now;
        if let Some(queue) = queue {
            fresh.queue = queue;
        }

        insert_task(&mut tx, &fresh).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(new_id)
    }

    async fn set_execution_state(&self, execution_id: ExecutionId, state: ExecutionState) -> Result<(), SenpukiError> {
        let now = Utc::now();
        let completed_at = if state.is_terminal() { Some(now) } else { None };
        sqlx::query(
            "UPDATE executions SET state = $1, updated_at = $2,
             completed_at = COALESCE(completed_at, $3) WHERE id = $4",
        )
        .bind(state.as_str())
        .bind(now)
        .bind(completed_at)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_execution_result(&self, execution_id: ExecutionId, result: Result<Payload, String>) -> Result<(), SenpukiError> {
        let now = Utc::now();
        match result {
            Ok(payload) => {
                sqlx::query("UPDATE executions SET result = $1, error = NULL, updated_at = $2 WHERE id = $3")
                    .bind(payload.as_bytes())
                    .bind(now)
                    .bind(execution_id)
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;
            }
            Err(error) => {
                sqlx::query("UPDATE executions SET error = $1, updated_at = $2 WHERE id = $3")
                    .bind(error)
                    .bind(now)
                    .bind(execution_id)
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;
            }
        }
        Ok(())
    }

    async fn add_counter(&self, execution_id: ExecutionId, name: &str, delta: i64) -> Result<i64, SenpukiError> {
        let row = sqlx::query(
            "INSERT INTO execution_counters (execution_id, name, value) VALUES ($1, $2, $3)
             ON CONFLICT (execution_id, name) DO UPDATE SET value = execution_counters.value + $3
             RETURNING value",
        )
        .bind(execution_id)
        .bind(name)
        .bind(delta)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_get("value").map_err(db_err)
    }

    async fn set_custom_state(&self, execution_id: ExecutionId, key: &str, value: Payload) -> Result<(), SenpukiError> {
        sqlx::query(
            "INSERT INTO execution_state (execution_id, key, value) VALUES ($1, $2, $3)
             ON CONFLICT (execution_id, key) DO UPDATE SET value = $3",
        )
        .bind(execution_id)
        .bind(key)
        .bind(value.as_bytes())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_execution_state(&self, execution_id: ExecutionId) -> Result<Option<ExecutionView>, SenpukiError> {
        let Some(row) = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
        else {
            return Ok(None);
        };
        let execution = execution_from_row(&row)?;

        let counter_rows = sqlx::query("SELECT name, value FROM execution_counters WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let mut counters = HashMap::new();
        for row in counter_rows {
            let name: String = row.try_get("name").map_err(db_err)?;
            let value: i64 = row.try_get("value").map_err(db_err)?;
            counters.insert(name, value);
        }

        let state_rows = sqlx::query("SELECT key, value FROM execution_state WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let mut custom_state = HashMap::new();
        for row in state_rows {
            let key: String = row.try_get("key").map_err(db_err)?;
            let value: Vec<u8> = row.try_get("value").map_err(db_err)?;
            custom_state.insert(key, Payload(value));
        }

        let mut view: ExecutionView = execution.into();
        view.counters = counters;
        view.custom_state = custom_state;
        Ok(Some(view))
    }

    async fn send_signal(&self, execution_id: ExecutionId, name: &str, payload: Payload) -> Result<(), SenpukiError> {
        sqlx::query("INSERT INTO signals (execution_id, name, payload, created_at) VALUES ($1, $2, $3, $4)")
            .bind(execution_id)
            .bind(name)
            .bind(payload.as_bytes())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn consume_signal(&self, execution_id: ExecutionId, name: &str) -> Result<Option<Payload>, SenpukiError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            "SELECT id, payload FROM signals WHERE execution_id = $1 AND name = $2
             ORDER BY id ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
        )
        .bind(execution_id)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(None);
        };
        let id: i64 = row.try_get("id").map_err(db_err)?;
        let payload: Vec<u8> = row.try_get("payload").map_err(db_err)?;
        sqlx::query("DELETE FROM signals WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(Some(Payload(payload)))
    }

    async fn get_cache(&self, key: &str) -> Result<Option<Payload>, SenpukiError> {
        let Some(row) = sqlx::query("SELECT value, created_at, ttl_seconds FROM cache WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
        else {
            return Ok(None);
        };
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(db_err)?;
        let ttl_seconds: Option<i64> = row.try_get("ttl_seconds").map_err(db_err)?;
        let entry = CacheEntry {
            key: key.to_string(),
            value: Payload(row.try_get("value").map_err(db_err)?),
            created_at,
            ttl: ttl_seconds.map(ChronoDuration::seconds),
        };
        if entry.is_expired(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    async fn put_cache(&self, key: &str, value: Payload, ttl: Option<ChronoDuration>) -> Result<(), SenpukiError> {
        sqlx::query(
            "INSERT INTO cache (key, value, created_at, ttl_seconds) VALUES ($1, $2, $3, $4)
             ON CONFLICT (key) DO UPDATE SET value = $2, created_at = $3, ttl_seconds = $4",
        )
        .bind(key)
        .bind(value.as_bytes())
        .bind(Utc::now())
        .bind(ttl.map(|d| d.num_seconds()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn cleanup_executions(&self, older_than: DateTime<Utc>) -> Result<u64, SenpukiError> {
        let result = sqlx::query(
            "DELETE FROM executions WHERE state IN ('completed', 'failed', 'timed_out', 'cancelled')
             AND completed_at IS NOT NULL AND completed_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

async fn insert_task(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, task: &Task) -> Result<(), SenpukiError> {
    sqlx::query(
        "INSERT INTO tasks (id, execution_id, parent_task_id, kind, step_name, arguments, state,
         attempt, max_attempts, scheduled_for, expires_at, lease_expires_at, last_heartbeat_at,
         worker_id, queue, priority, tags, idempotency_key, cache_key, concurrency_group,
         concurrency_limit, result, error, progress, created_at, updated_at)
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23,$24,$25,$26)",
    )
    .bind(task.id)
    .bind(task.execution_id)
    .bind(task.parent_task_id)
    .bind(task.kind.as_str())
    .bind(&task.step_name)
    .bind(task.arguments.as_bytes())
    .bind(task.state.as_str())
    .bind(task.attempt as i32)
    .bind(task.max_attempts as i32)
    .bind(task.scheduled_for)
    .bind(task.expires_at)
    .bind(task.lease_expires_at)
    .bind(task.last_heartbeat_at)
    .bind(&task.worker_id)
    .bind(&task.queue)
    .bind(task.priority)
    .bind(encode_tags(&task.tags))
    .bind(&task.idempotency_key)
    .bind(&task.cache_key)
    .bind(&task.concurrency_group)
    .bind(task.concurrency_limit.map(|v| v as i32))
    .bind(task.result.as_ref().map(Payload::as_bytes))
    .bind(&task.error)
    .bind(encode_progress(&task.progress)?)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}
