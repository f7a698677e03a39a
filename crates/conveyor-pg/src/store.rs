//! Postgres-backed TaskStore.
//!
//! One table, `conveyor_tasks`. Claiming is a single
//! `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP LOCKED)` statement, so
//! concurrent claimers (other monitors, other processes) never see the same
//! row and never wait on each other's locks.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database / PoolClosed / Io / other | `Backend` |
//! | RowNotFound | `Backend` (queries use `fetch_optional`) |
//! | Decode / ColumnDecode | `Serialization` |
//!
//! `NotFound`, `NotProcessing` and `InvalidTransition` come from explicit
//! status checks, never from SQL errors.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::domain::{
    ContentType, FailureReason, NewTask, OutcomeMetadata, TaskId, TaskRecord, TaskStatus,
    format_retry_message,
};
use conveyor_core::ports::{
    ClaimFilter, IdGenerator, OrphanFilter, PersistResult, QueueCounts, StoreError, SystemClock,
    TaskStore, UlidGenerator,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, info, instrument};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conveyor_tasks (
    id             TEXT PRIMARY KEY,
    kind           TEXT NOT NULL,
    content_type   TEXT NOT NULL,
    content_id     TEXT NOT NULL,
    created_at     TIMESTAMPTZ NOT NULL,
    updated_at     TIMESTAMPTZ NOT NULL,
    status         TEXT NOT NULL,
    status_message TEXT,
    retry_count    INTEGER NOT NULL DEFAULT 0,
    payload        JSONB NOT NULL,
    outcome        JSONB,
    parent_id      TEXT REFERENCES conveyor_tasks (id),
    checkpoints    TEXT[] NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS conveyor_tasks_claim_idx
    ON conveyor_tasks (kind, status, created_at, id);
CREATE INDEX IF NOT EXISTS conveyor_tasks_content_idx
    ON conveyor_tasks (kind, content_id, status);
CREATE INDEX IF NOT EXISTS conveyor_tasks_parent_idx
    ON conveyor_tasks (parent_id);
"#;

const COLUMNS: &str = "id, kind, content_type, content_id, created_at, updated_at, status, \
                       status_message, retry_count, payload, outcome, parent_id, checkpoints";

/// `$1` kind, `$2` content types (NULL = any), `$3` min age in seconds,
/// `$4` serialize per content, `$5` parent checkpoint (NULL = none),
/// `$6` limit.
const CLAIM_SQL: &str = r#"
UPDATE conveyor_tasks AS t
SET status = 'Processing', updated_at = now()
FROM (
    SELECT c.id
    FROM conveyor_tasks c
    WHERE c.status = 'Queued'
      AND c.kind = $1
      AND ($2::text[] IS NULL OR c.content_type = ANY($2))
      AND c.created_at <= now() - make_interval(secs => $3)
      AND (NOT $4 OR NOT EXISTS (
          SELECT 1 FROM conveyor_tasks o
          WHERE o.kind = c.kind
            AND o.content_id = c.content_id
            AND o.id <> c.id
            AND (o.status = 'Processing'
                 OR (o.status = 'Queued' AND (o.created_at, o.id) < (c.created_at, c.id)))
      ))
      AND ($5::text IS NULL OR c.parent_id IS NULL OR EXISTS (
          SELECT 1 FROM conveyor_tasks p
          WHERE p.id = c.parent_id AND $5 = ANY(p.checkpoints)
      ))
    ORDER BY c.created_at, c.id
    LIMIT $6
    FOR UPDATE SKIP LOCKED
) AS picked
WHERE t.id = picked.id
RETURNING t.id, t.kind, t.content_type, t.content_id, t.created_at, t.updated_at, t.status,
          t.status_message, t.retry_count, t.payload, t.outcome, t.parent_id, t.checkpoints
"#;

/// `$1` root id, `$2` reason, `$3` terminal statuses.
const CANCEL_SQL: &str = r#"
WITH RECURSIVE tree AS (
    SELECT id FROM conveyor_tasks
    WHERE id = $1 AND NOT (status = ANY($3))
    UNION
    SELECT c.id FROM conveyor_tasks c
    JOIN tree ON c.parent_id = tree.id
    WHERE NOT (c.status = ANY($3))
)
UPDATE conveyor_tasks AS t
SET status = 'Canceled', status_message = $2, updated_at = now()
FROM tree
WHERE t.id = tree.id
RETURNING t.id
"#;

/// TaskStore over a Postgres pool.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
    ids: Arc<dyn IdGenerator>,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the table and indexes if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        info!("conveyor_tasks schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Error for a guarded update that touched no row.
    async fn explain_missed_update(&self, id: TaskId) -> StoreError {
        let status = sqlx::query("SELECT status FROM conveyor_tasks WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await;
        match status {
            Ok(Some(row)) => match row.try_get::<String, _>("status") {
                Ok(raw) => match raw.parse::<TaskStatus>() {
                    Ok(status) => StoreError::NotProcessing { id, status },
                    Err(e) => serialization(e),
                },
                Err(e) => map_sqlx_error("status lookup", e),
            },
            Ok(None) => StoreError::NotFound(id),
            Err(e) => map_sqlx_error("status lookup", e),
        }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn enqueue(&self, task: NewTask) -> Result<TaskRecord, StoreError> {
        let id = self.ids.generate_task_id();
        let sql = format!(
            "INSERT INTO conveyor_tasks \
             (id, kind, content_type, content_id, created_at, updated_at, status, retry_count, payload, parent_id) \
             VALUES ($1, $2, $3, $4, now(), now(), 'Queued', 0, $5, $6) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(task.kind.as_str())
            .bind(task.content_type.as_str())
            .bind(&task.content_id)
            .bind(&task.payload)
            .bind(task.parent_id.map(|p| p.to_string()))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;
        decode(&row)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM conveyor_tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode).transpose()
    }

    async fn children(&self, parent_id: TaskId) -> Result<Vec<TaskRecord>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM conveyor_tasks WHERE parent_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(parent_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("children", e))?;
        rows.iter().map(decode).collect()
    }

    #[instrument(skip_all, fields(kind = %filter.kind, max_count = max_count))]
    async fn claim_ready(
        &self,
        max_count: usize,
        filter: &ClaimFilter,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(CLAIM_SQL)
            .bind(filter.kind.as_str())
            .bind(content_type_names(filter.content_types.as_deref()))
            .bind(filter.min_age.as_secs_f64())
            .bind(filter.serialize_per_content)
            .bind(filter.parent_checkpoint.as_deref())
            .bind(i64::try_from(max_count).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_ready", e))?;

        let mut claimed = rows.iter().map(decode).collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not keep the subquery's order.
        claimed.sort_by_key(|t| (t.created_at, t.id));
        debug!(kind = %filter.kind, claimed = claimed.len(), "claimed tasks");
        Ok(claimed)
    }

    #[instrument(skip_all, fields(task_id = %id, status = %status))]
    async fn persist_outcome(
        &self,
        id: TaskId,
        status: TaskStatus,
        outcome: OutcomeMetadata,
    ) -> Result<PersistResult, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("persist_outcome", e))?;

        let current = sqlx::query("SELECT status FROM conveyor_tasks WHERE id = $1 FOR UPDATE")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("persist_outcome", e))?
            .ok_or(StoreError::NotFound(id))?;
        let current: TaskStatus = current
            .try_get::<String, _>("status")
            .map_err(|e| map_sqlx_error("persist_outcome", e))?
            .parse()
            .map_err(serialization)?;

        match current {
            TaskStatus::Canceled => {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("persist_outcome", e))?;
                return Ok(PersistResult::DiscardedCanceled);
            }
            TaskStatus::Processing => {}
            other => return Err(StoreError::NotProcessing { id, status: other }),
        }
        if !matches!(
            status,
            TaskStatus::Success | TaskStatus::Error | TaskStatus::Canceled
        ) {
            return Err(StoreError::InvalidTransition {
                id,
                from: current,
                to: status,
            });
        }

        let message = outcome.status_message();
        let outcome = serde_json::to_value(&outcome).map_err(serialization)?;
        sqlx::query(
            "UPDATE conveyor_tasks \
             SET status = $2, outcome = $3, status_message = COALESCE($4, status_message), updated_at = now() \
             WHERE id = $1",
        )
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(outcome)
        .bind(message)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("persist_outcome", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("persist_outcome", e))?;
        Ok(PersistResult::Applied)
    }

    async fn find_orphaned(&self, filter: &OrphanFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM conveyor_tasks \
             WHERE status = 'Processing' AND kind = $1 \
               AND ($2::text[] IS NULL OR content_type = ANY($2)) \
             ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.kind.as_str())
            .bind(content_type_names(filter.content_types.as_deref()))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_orphaned", e))?;
        rows.iter().map(decode).collect()
    }

    async fn requeue(&self, id: TaskId, retry_count: u32) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE conveyor_tasks \
             SET status = 'Queued', retry_count = $2, status_message = $3, \
                 checkpoints = '{}', outcome = NULL, updated_at = now() \
             WHERE id = $1 AND status = 'Processing'",
        )
        .bind(id.to_string())
        .bind(i32::try_from(retry_count).unwrap_or(i32::MAX))
        .bind(format_retry_message(retry_count))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue", e))?;
        if result.rows_affected() == 0 {
            return Err(self.explain_missed_update(id).await);
        }
        Ok(())
    }

    async fn fail(&self, id: TaskId, failure: FailureReason) -> Result<(), StoreError> {
        let outcome = OutcomeMetadata {
            finished_at: Some(Utc::now()),
            ..OutcomeMetadata::failed(failure.kind, failure.message.clone())
        };
        let outcome = serde_json::to_value(&outcome).map_err(serialization)?;
        let result = sqlx::query(
            "UPDATE conveyor_tasks \
             SET status = 'Error', status_message = $2, outcome = $3, updated_at = now() \
             WHERE id = $1 AND status = 'Processing'",
        )
        .bind(id.to_string())
        .bind(&failure.message)
        .bind(outcome)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;
        if result.rows_affected() == 0 {
            return Err(self.explain_missed_update(id).await);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(task_id = %id, reason = reason))]
    async fn cancel(&self, id: TaskId, reason: &str) -> Result<Vec<TaskId>, StoreError> {
        let exists = sqlx::query("SELECT 1 FROM conveyor_tasks WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("cancel", e))?;
        if exists.is_none() {
            return Err(StoreError::NotFound(id));
        }

        let rows = sqlx::query(CANCEL_SQL)
            .bind(id.to_string())
            .bind(reason)
            .bind(terminal_status_names())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("cancel", e))?;
        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("id").map_err(|e| map_sqlx_error("cancel", e))?;
                parse_id(&raw)
            })
            .collect()
    }

    async fn record_checkpoint(&self, id: TaskId, checkpoint: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE conveyor_tasks \
             SET checkpoints = CASE WHEN $2 = ANY(checkpoints) THEN checkpoints \
                                    ELSE array_append(checkpoints, $2) END, \
                 updated_at = now() \
             WHERE id = $1 AND status = 'Processing'",
        )
        .bind(id.to_string())
        .bind(checkpoint)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_checkpoint", e))?;
        if result.rows_affected() == 0 {
            return Err(self.explain_missed_update(id).await);
        }
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM conveyor_tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("counts", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("counts", e))?;
            let status = status.parse::<TaskStatus>().map_err(serialization)?;
            counts.add(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}

/// Raw column values of one `conveyor_tasks` row.
#[derive(Debug, Clone)]
struct TaskRow {
    id: String,
    kind: String,
    content_type: String,
    content_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    status: String,
    status_message: Option<String>,
    retry_count: i32,
    payload: serde_json::Value,
    outcome: Option<serde_json::Value>,
    parent_id: Option<String>,
    checkpoints: Vec<String>,
}

impl<'r> FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            content_type: row.try_get("content_type")?,
            content_id: row.try_get("content_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            status: row.try_get("status")?,
            status_message: row.try_get("status_message")?,
            retry_count: row.try_get("retry_count")?,
            payload: row.try_get("payload")?,
            outcome: row.try_get("outcome")?,
            parent_id: row.try_get("parent_id")?,
            checkpoints: row.try_get("checkpoints")?,
        })
    }
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(TaskRecord {
            id: parse_id(&row.id)?,
            kind: row.kind.parse().map_err(serialization)?,
            content_type: ContentType::new(row.content_type),
            content_id: row.content_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            status: row.status.parse().map_err(serialization)?,
            status_message: row.status_message,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            payload: row.payload,
            outcome: row
                .outcome
                .map(serde_json::from_value)
                .transpose()
                .map_err(serialization)?,
            parent_id: row.parent_id.as_deref().map(parse_id).transpose()?,
            checkpoints: row.checkpoints.into_iter().collect::<BTreeSet<_>>(),
        })
    }
}

fn decode(row: &PgRow) -> Result<TaskRecord, StoreError> {
    TaskRow::from_row(row)
        .map_err(|e| StoreError::Serialization(format!("failed to decode task row: {e}")))?
        .try_into()
}

fn serialization(err: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(err.to_string())
}

fn parse_id(raw: &str) -> Result<TaskId, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Serialization(format!("bad task id '{raw}': {e}")))
}

fn content_type_names(types: Option<&[ContentType]>) -> Option<Vec<String>> {
    types.map(|types| types.iter().map(|t| t.as_str().to_string()).collect())
}

fn terminal_status_names() -> Vec<String> {
    TaskStatus::ALL
        .into_iter()
        .filter(|s| s.is_terminal())
        .map(|s| s.as_str().to_string())
        .collect()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Backend(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Backend(format!("unexpected row not found in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}
