use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use crate::entities::{Run, RunOptions, RunStatus, VerifyStatus, WorkerHeartbeat};
use crate::{Store, StoreResult};

const RUN_COLUMNS: &str = "id, tenant_id, status, domains, options, domains_total, \
     domains_completed, emails_found, emails_verified, valid_count, risky_count, \
     invalid_count, unknown_count, error, created_at, started_at, finished_at";

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct RunEvent {
    pub id: i64,
    pub run_id: Uuid,
    pub at: DateTime<Utc>,
    pub stage: String,
    pub domain: Option<String>,
    pub code: String,
    pub detail: Option<String>,
}

impl Store {
    pub async fn create_run(
        &self,
        tenant_id: Uuid,
        domains: &[String],
        options: &RunOptions,
    ) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO runs (id, tenant_id, domains, options) VALUES ($1, $2, $3, $4)")
            .bind(id)
            .bind(tenant_id)
            .bind(Json(domains))
            .bind(Json(options))
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        let run = sqlx::query_as::<_, Run>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(run)
    }

    /// Atomically claim the oldest queued run. The queued->running edge
    /// fires at most once per run, which is what makes re-submitting the
    /// same run a no-op.
    pub async fn claim_queued_run(&self) -> StoreResult<Option<Run>> {
        let run = sqlx::query_as::<_, Run>(&format!(
            "UPDATE runs SET status = 'running', started_at = now()
             WHERE id = (
               SELECT id FROM runs WHERE status = 'queued'
               ORDER BY created_at LIMIT 1
               FOR UPDATE SKIP LOCKED
             )
             RETURNING {RUN_COLUMNS}"
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(run)
    }

    /// Claim one specific run. Same queued->running edge as
    /// `claim_queued_run`, for targeted picks.
    pub async fn claim_run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        let run = sqlx::query_as::<_, Run>(&format!(
            "UPDATE runs SET status = 'running', started_at = now()
             WHERE id = $1 AND status = 'queued'
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(run)
    }

    pub async fn running_runs(&self) -> StoreResult<Vec<Run>> {
        let runs = sqlx::query_as::<_, Run>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status = 'running' ORDER BY started_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    /// Persist the validated, deduplicated domain list the run will
    /// actually process, together with its count. Callers commit this only
    /// once the run's jobs are all enqueued: a non-zero `domains_total` is
    /// the signal that fan-out finished.
    pub async fn set_effective_domains(&self, run_id: Uuid, domains: &[String]) -> StoreResult<()> {
        sqlx::query("UPDATE runs SET domains = $2, domains_total = $3 WHERE id = $1")
            .bind(run_id)
            .bind(Json(domains))
            .bind(domains.len() as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Completion is recomputed by the finalizer sweep; the LEAST guard
    /// keeps `domains_completed <= domains_total` under any interleaving.
    pub async fn set_domains_completed(&self, run_id: Uuid, completed: i32) -> StoreResult<()> {
        sqlx::query(
            "UPDATE runs SET domains_completed = LEAST($2, domains_total) WHERE id = $1",
        )
        .bind(run_id)
        .bind(completed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_emails_found(&self, run_id: Uuid, n: i32) -> StoreResult<()> {
        sqlx::query("UPDATE runs SET emails_found = emails_found + $2 WHERE id = $1")
            .bind(run_id)
            .bind(n)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Aggregating upsert from a single probe outcome.
    pub async fn record_verification_progress(
        &self,
        run_id: Uuid,
        status: VerifyStatus,
    ) -> StoreResult<()> {
        let column = match status {
            VerifyStatus::Valid => "valid_count",
            VerifyStatus::RiskyCatchAll => "risky_count",
            VerifyStatus::Invalid => "invalid_count",
            VerifyStatus::UnknownTimeout => "unknown_count",
        };
        sqlx::query(&format!(
            "UPDATE runs SET emails_verified = emails_verified + 1,
                             {column} = {column} + 1
             WHERE id = $1"
        ))
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recompute the email counters from the system of record. Idempotent;
    /// used at finalization so the terminal progress is exact even after
    /// retries double-counted an increment.
    pub async fn aggregate_run_counts(&self, run_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            "UPDATE runs r SET
               emails_found = agg.found,
               emails_verified = agg.verified,
               valid_count = agg.valid,
               risky_count = agg.risky,
               invalid_count = agg.invalid,
               unknown_count = agg.unknown
             FROM (
               SELECT COUNT(e.id)::INT AS found,
                      COUNT(l.verify_status)::INT AS verified,
                      COUNT(*) FILTER (WHERE l.verify_status = 'valid')::INT AS valid,
                      COUNT(*) FILTER (WHERE l.verify_status = 'risky_catch_all')::INT AS risky,
                      COUNT(*) FILTER (WHERE l.verify_status = 'invalid')::INT AS invalid,
                      COUNT(*) FILTER (WHERE l.verify_status = 'unknown_timeout')::INT AS unknown
               FROM companies c
               JOIN emails e ON e.tenant_id = c.tenant_id AND e.company_id = c.id
               LEFT JOIN LATERAL (
                 SELECT v.verify_status FROM verification_results v
                 WHERE v.tenant_id = e.tenant_id AND v.email_id = e.id
                 ORDER BY COALESCE(v.verified_at, v.checked_at) DESC, v.id DESC
                 LIMIT 1
               ) l ON TRUE
               WHERE c.run_id = $1
             ) agg
             WHERE r.id = $1",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// running -> terminal, once. Terminal states are irreversible.
    pub async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        debug_assert!(status.is_terminal());
        let res = sqlx::query(
            "UPDATE runs SET status = $2, error = $3, finished_at = now()
             WHERE id = $1 AND status = 'running'",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Reject a run before it ever ran (budget or validation failures).
    pub async fn reject_run(&self, run_id: Uuid, error: &str) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE runs SET status = 'failed', error = $2, finished_at = now()
             WHERE id = $1 AND status IN ('queued', 'running')",
        )
        .bind(run_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn cancel_run(&self, run_id: Uuid) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE runs SET status = 'cancelled', finished_at = now()
             WHERE id = $1 AND status IN ('queued', 'running')",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Distinct companies created for the tenant inside the trailing window.
    /// Backs the 24-hour hard cap checked at run start.
    pub async fn count_recent_companies(
        &self,
        tenant_id: Uuid,
        window_hours: i64,
    ) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM companies
             WHERE tenant_id = $1 AND created_at > now() - make_interval(hours => $2::int)",
        )
        .bind(tenant_id)
        .bind(window_hours)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn record_run_event(
        &self,
        run_id: Uuid,
        stage: &str,
        domain: Option<&str>,
        code: &str,
        detail: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO run_events (run_id, stage, domain, code, detail)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(run_id)
        .bind(stage)
        .bind(domain)
        .bind(code)
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn run_events(&self, run_id: Uuid, limit: i64) -> StoreResult<Vec<RunEvent>> {
        let events = sqlx::query_as::<_, RunEvent>(
            "SELECT id, run_id, at, stage, domain, code, detail
             FROM run_events WHERE run_id = $1 ORDER BY at DESC, id DESC LIMIT $2",
        )
        .bind(run_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    pub async fn heartbeat_worker(&self, worker_id: &str, queues: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO worker_heartbeats (worker_id, queues, last_seen_at)
             VALUES ($1, $2, now())
             ON CONFLICT (worker_id) DO UPDATE SET queues = $2, last_seen_at = now()",
        )
        .bind(worker_id)
        .bind(queues)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn worker_heartbeats(&self) -> StoreResult<Vec<WorkerHeartbeat>> {
        let rows = sqlx::query_as::<_, WorkerHeartbeat>(
            "SELECT worker_id, queues, last_seen_at FROM worker_heartbeats
             ORDER BY last_seen_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
