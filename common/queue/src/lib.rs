//! Durable named job queues in Postgres.
//!
//! Jobs move `ready -> in_flight -> done`, or back to `ready` on retryable
//! failure with a backoff delay, or to `dead` (the DLQ) once attempts are
//! exhausted. Reservation takes a lease; a worker that stops heartbeating
//! loses the lease and the job returns to `ready` with its attempt counted.
//! `depends_on` gates reservation until every dependency is `done`.
//! Delivery is at-least-once: handlers must be idempotent.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgQueryResult;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use uuid::Uuid;

pub mod backoff;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Handler outcome carried back to `fail`: whether the failure should
/// re-enter the queue or go straight to the DLQ.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
    pub retryable: bool,
}

impl TaskError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Ready,
    InFlight,
    Done,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Ready => "ready",
            JobStatus::InFlight => "in_flight",
            JobStatus::Done => "done",
            JobStatus::Dead => "dead",
        }
    }
}

/// A reserved job. The worker owns it until `complete`/`fail`, or until the
/// lease lapses.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub max_attempts: i32,
    pub group_id: Option<Uuid>,
    pub group_key: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeadJob {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub first_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QueueDepth {
    pub queue: String,
    pub ready: i64,
    pub in_flight: i64,
    pub dead: i64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EnqueueOpts {
    pub delay: Option<Duration>,
    pub max_attempts: Option<i32>,
}

#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub leases_reclaimed: u64,
    pub cancelled: u64,
    pub dependency_failed: u64,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
}

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(include_str!("schema.sql")).execute(&self.pool).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: &serde_json::Value,
        depends_on: &[Uuid],
        group_id: Option<Uuid>,
        group_key: Option<&str>,
        opts: EnqueueOpts,
    ) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        let delay_secs = opts.delay.map(|d| d.as_secs_f64()).unwrap_or(0.0);
        sqlx::query(
            "INSERT INTO jobs (id, queue, payload, depends_on, group_id, group_key,
                               max_attempts, available_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, now() + make_interval(secs => $8))",
        )
        .bind(id)
        .bind(queue)
        .bind(payload)
        .bind(depends_on.to_vec())
        .bind(group_id)
        .bind(group_key)
        .bind(opts.max_attempts.unwrap_or(5))
        .bind(delay_secs)
        .execute(&self.pool)
        .await?;
        tracing::debug!(job_id = %id, queue, "enqueued job");
        Ok(id)
    }

    /// Reserve the oldest available job from any of `queues`. FIFO within a
    /// queue, subject to `available_at`; jobs with unmet dependencies are
    /// invisible. The attempt is counted at reservation.
    pub async fn reserve(
        &self,
        queues: &[&str],
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let names: Vec<String> = queues.iter().map(|q| q.to_string()).collect();
        let mut tx = self.pool.begin().await?;
        let job: Option<Job> = sqlx::query_as(
            "SELECT id, queue, payload, attempts, max_attempts, group_id, group_key, enqueued_at
             FROM jobs
             WHERE queue = ANY($1) AND status = 'ready' AND available_at <= now()
               AND NOT EXISTS (
                 SELECT 1 FROM jobs dep
                 WHERE dep.id = ANY(jobs.depends_on) AND dep.status <> 'done'
               )
             ORDER BY available_at, enqueued_at
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(&names)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(mut job) = job else {
            tx.rollback().await?;
            return Ok(None);
        };
        sqlx::query(
            "UPDATE jobs SET status = 'in_flight', worker_id = $2, attempts = attempts + 1,
                             lease_expires_at = now() + make_interval(secs => $3)
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        job.attempts += 1;
        Ok(Some(job))
    }

    /// Extend the lease. Returns false when the lease was already lost, in
    /// which case the worker must abandon the job.
    pub async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, QueueError> {
        let res: PgQueryResult = sqlx::query(
            "UPDATE jobs SET lease_expires_at = now() + make_interval(secs => $3)
             WHERE id = $1 AND worker_id = $2 AND status = 'in_flight'",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Returns false when the lease was lost before completion (the job may
    /// run again elsewhere; handlers being idempotent makes that harmless).
    pub async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<bool, QueueError> {
        let res = sqlx::query(
            "UPDATE jobs SET status = 'done', finished_at = now(),
                             worker_id = NULL, lease_expires_at = NULL
             WHERE id = $1 AND worker_id = $2 AND status = 'in_flight'",
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Retryable failures with attempts left re-enqueue after the backoff
    /// schedule; everything else moves to the DLQ.
    pub async fn fail(
        &self,
        job: &Job,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<(), QueueError> {
        let retry = retryable && job.attempts < job.max_attempts;
        let delay = backoff::jittered_retry_delay(job.attempts).as_secs_f64();
        sqlx::query(
            "UPDATE jobs SET
               status = CASE WHEN $3 THEN 'ready' ELSE 'dead' END,
               available_at = CASE WHEN $3 THEN now() + make_interval(secs => $4)
                                   ELSE available_at END,
               dead_at = CASE WHEN $3 THEN NULL ELSE now() END,
               last_error = $5, worker_id = NULL, lease_expires_at = NULL
             WHERE id = $1 AND worker_id = $2 AND status = 'in_flight'",
        )
        .bind(job.id)
        .bind(worker_id)
        .bind(retry)
        .bind(delay)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if retry {
            tracing::debug!(job_id = %job.id, attempts = job.attempts, error, "job re-enqueued");
        } else {
            tracing::warn!(job_id = %job.id, attempts = job.attempts, error, "job moved to DLQ");
        }
        Ok(())
    }

    /// Request lazy cancellation of every job in a group (a run). Ready jobs
    /// are dead-marked by `maintain`; in-flight handlers observe
    /// `group_cancelled` at their next suspension point.
    pub async fn cancel_group(&self, group_id: Uuid) -> Result<(), QueueError> {
        sqlx::query(
            "INSERT INTO queue_cancellations (group_id) VALUES ($1)
             ON CONFLICT (group_id) DO NOTHING",
        )
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn group_cancelled(&self, group_id: Uuid) -> Result<bool, QueueError> {
        let hit: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM queue_cancellations WHERE group_id = $1",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hit.is_some())
    }

    /// Periodic upkeep: reclaim lapsed leases, dead-mark cancelled groups'
    /// ready jobs, and cascade `dead` through dependency chains so a failed
    /// stage never strands its dependents in `ready` forever.
    pub async fn maintain(&self) -> Result<MaintenanceReport, QueueError> {
        let mut report = MaintenanceReport::default();
        let reclaimed = sqlx::query(
            "UPDATE jobs SET status = 'ready', worker_id = NULL, lease_expires_at = NULL,
                             last_error = 'lease_expired'
             WHERE status = 'in_flight' AND lease_expires_at < now()",
        )
        .execute(&self.pool)
        .await?;
        report.leases_reclaimed = reclaimed.rows_affected();

        let cancelled = sqlx::query(
            "UPDATE jobs SET status = 'dead', dead_at = now(), last_error = 'run_cancelled'
             WHERE status = 'ready'
               AND group_id IN (SELECT group_id FROM queue_cancellations)",
        )
        .execute(&self.pool)
        .await?;
        report.cancelled = cancelled.rows_affected();

        loop {
            let cascaded = sqlx::query(
                "UPDATE jobs SET status = 'dead', dead_at = now(), last_error = 'dependency_failed'
                 WHERE status = 'ready'
                   AND EXISTS (
                     SELECT 1 FROM jobs dep
                     WHERE dep.id = ANY(jobs.depends_on) AND dep.status = 'dead'
                   )",
            )
            .execute(&self.pool)
            .await?;
            if cascaded.rows_affected() == 0 {
                break;
            }
            report.dependency_failed += cascaded.rows_affected();
        }
        Ok(report)
    }

    /// Jobs not yet terminal for a group (optionally narrowed to one
    /// group_key, i.e. one domain). Zero means the group's work is settled.
    pub async fn open_jobs_in_group(
        &self,
        group_id: Uuid,
        group_key: Option<&str>,
    ) -> Result<i64, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs
             WHERE group_id = $1 AND ($2::TEXT IS NULL OR group_key = $2)
               AND status IN ('ready', 'in_flight')",
        )
        .bind(group_id)
        .bind(group_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn dead_jobs_in_group(
        &self,
        group_id: Uuid,
        group_key: Option<&str>,
    ) -> Result<i64, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs
             WHERE group_id = $1 AND ($2::TEXT IS NULL OR group_key = $2)
               AND status = 'dead'",
        )
        .bind(group_id)
        .bind(group_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Distinct group keys (domains) of a group with at least one dead job.
    pub async fn failed_group_keys(&self, group_id: Uuid) -> Result<Vec<String>, QueueError> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT group_key FROM jobs
             WHERE group_id = $1 AND status = 'dead' AND group_key IS NOT NULL",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    pub async fn depths(&self) -> Result<Vec<QueueDepth>, QueueError> {
        let rows: Vec<QueueDepth> = sqlx::query_as(
            "SELECT queue,
                    COUNT(*) FILTER (WHERE status = 'ready') AS ready,
                    COUNT(*) FILTER (WHERE status = 'in_flight') AS in_flight,
                    COUNT(*) FILTER (WHERE status = 'dead') AS dead
             FROM jobs GROUP BY queue ORDER BY queue",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadJob>, QueueError> {
        let rows: Vec<DeadJob> = sqlx::query_as(
            "SELECT id, queue, payload, attempts, last_error, dead_at AS first_seen
             FROM jobs WHERE status = 'dead'
             ORDER BY dead_at DESC NULLS LAST LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Put a dead job back on its queue with a fresh attempt budget.
    pub async fn requeue_dead(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let res = sqlx::query(
            "UPDATE jobs SET status = 'ready', attempts = 0, dead_at = NULL,
                             last_error = NULL, available_at = now()
             WHERE id = $1 AND status = 'dead'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}
