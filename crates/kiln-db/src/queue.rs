//! The task outbox.
//!
//! Tasks are inserted by [`crate::Transaction::enqueue`] and handed out to
//! workers from here.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use kiln_core::task::{Task, TaskKind, TaskPayload};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_CLAIMED: &str = "claimed";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

/// Seconds a claim holds before another worker may take the task over.
pub const CLAIM_LEASE_SECS: i64 = 300;

/// A task row in the outbox.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueuedTask {
    pub id: uuid::Uuid,
    pub kind: String,
    pub build_id: i64,
    pub dedup_key: String,
    pub status: String,
    pub attempts: i32,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueuedTask {
    pub(crate) fn pending(task: &Task, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            kind: task.kind.to_string(),
            build_id: task.payload.build_id.get(),
            dedup_key: task.dedup_key.clone(),
            status: STATUS_PENDING.to_string(),
            attempts: 0,
            claimed_by: None,
            claimed_at: None,
            error: None,
            created_at: now,
        }
    }

    /// Decodes the row back into a task.
    pub fn task(&self) -> DbResult<Task> {
        let kind: TaskKind = self
            .kind
            .parse()
            .map_err(|e: kiln_core::Error| DbError::Corrupt(format!("task {}: {e}", self.id)))?;
        Ok(Task {
            kind,
            payload: TaskPayload {
                build_id: self.build_id.into(),
            },
            dedup_key: self.dedup_key.clone(),
        })
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Claims the oldest pending task, or a claimed one whose lease ran out.
    async fn claim(&self, worker_id: &str) -> DbResult<Option<QueuedTask>>;

    async fn complete(&self, id: uuid::Uuid) -> DbResult<()>;

    async fn fail(&self, id: uuid::Uuid, error: &str) -> DbResult<()>;

    /// Puts a claimed task back to pending.
    async fn release(&self, id: uuid::Uuid) -> DbResult<()>;

    /// Every task enqueued for a build, oldest first.
    async fn tasks_for_build(&self, build_id: i64) -> DbResult<Vec<QueuedTask>>;
}

/// Task queue backed by PostgreSQL.
pub struct PgTaskQueue {
    pool: PgPool,
    lease: Duration,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease: Duration::seconds(CLAIM_LEASE_SECS),
        }
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    /// Uses SKIP LOCKED so concurrent workers never claim the same row.
    async fn claim(&self, worker_id: &str) -> DbResult<Option<QueuedTask>> {
        let task = sqlx::query_as::<_, QueuedTask>(
            r#"
            UPDATE tasks
            SET status = 'claimed', claimed_by = $1, claimed_at = NOW(), attempts = attempts + 1
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'pending'
                   OR (status = 'claimed' AND claimed_at < NOW() - make_interval(secs => $2))
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(self.lease.num_milliseconds() as f64 / 1000.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    async fn complete(&self, id: uuid::Uuid) -> DbResult<()> {
        sqlx::query("UPDATE tasks SET status = 'completed' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(&self, id: uuid::Uuid, error: &str) -> DbResult<()> {
        sqlx::query("UPDATE tasks SET status = 'failed', error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, id: uuid::Uuid) -> DbResult<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'pending', claimed_by = NULL, claimed_at = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn tasks_for_build(&self, build_id: i64) -> DbResult<Vec<QueuedTask>> {
        let tasks = sqlx::query_as::<_, QueuedTask>(
            "SELECT * FROM tasks WHERE build_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(build_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }
}
