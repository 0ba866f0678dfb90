//! Layered rate limiting over shared Postgres state.
//!
//! Three primitives, all keyed by an opaque scope string:
//! - concurrency gates (semaphore counters) taken in caller-supplied order,
//!   all-or-nothing, released through a lease;
//! - token buckets refilling at a configured rate, 1-second granularity;
//! - per-host cool-offs that double on repeated strikes up to a cap.
//!
//! State lives in the database so limits hold across worker processes and
//! survive restarts. Consumed tokens are never refunded: a request that was
//! made counts against the budget regardless of its outcome.

use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

pub mod bucket;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limiter storage error: {0}")]
    Db(#[from] sqlx::Error),
}

/// One concurrency scope to take, e.g. `("global", 12)` or `("mx:mx1.example.com", 2)`.
#[derive(Debug, Clone)]
pub struct ScopeLimit {
    pub scope: String,
    pub cap: i32,
}

impl ScopeLimit {
    pub fn new(scope: impl Into<String>, cap: i32) -> Self {
        Self { scope: scope.into(), cap }
    }
}

/// Held concurrency permits across one or more scopes. Must be released.
#[derive(Debug)]
pub struct Lease {
    pub id: Uuid,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Consume {
    Ok,
    WaitUntil(DateTime<Utc>),
}

#[derive(Clone)]
pub struct RateLimiter {
    pool: PgPool,
}

impl RateLimiter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the limiter tables if missing. Idempotent.
    pub async fn ensure_schema(&self) -> Result<(), RateLimitError> {
        sqlx::raw_sql(include_str!("schema.sql")).execute(&self.pool).await?;
        Ok(())
    }

    /// Take all scopes in order within one transaction. Any full gate rolls
    /// the whole attempt back, so partially-taken permits never leak.
    pub async fn try_acquire(
        &self,
        scopes: &[ScopeLimit],
        lease_ttl: Duration,
    ) -> Result<Option<Lease>, RateLimitError> {
        let lease_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;
        for limit in scopes {
            let taken: Option<i32> = sqlx::query_scalar(
                "INSERT INTO rl_gates (scope, held, cap) VALUES ($1, 1, $2)
                 ON CONFLICT (scope) DO UPDATE
                   SET held = rl_gates.held + 1, cap = $2, updated_at = now()
                   WHERE rl_gates.held < $2
                 RETURNING held",
            )
            .bind(&limit.scope)
            .bind(limit.cap)
            .fetch_optional(&mut *tx)
            .await?;
            if taken.is_none() {
                tx.rollback().await?;
                return Ok(None);
            }
            sqlx::query(
                "INSERT INTO rl_leases (id, scope, expires_at)
                 VALUES ($1, $2, now() + make_interval(secs => $3))",
            )
            .bind(lease_id)
            .bind(&limit.scope)
            .bind(lease_ttl.as_secs_f64())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(Some(Lease { id: lease_id, scopes: scopes.iter().map(|s| s.scope.clone()).collect() }))
    }

    /// Blocking variant: retry `try_acquire` until `timeout` elapses.
    /// Returns `None` when the deadline passes without all gates opening;
    /// callers surface that as `rate_limited` and back off through the queue.
    pub async fn acquire(
        &self,
        scopes: &[ScopeLimit],
        timeout: Duration,
        lease_ttl: Duration,
    ) -> Result<Option<Lease>, RateLimitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(lease) = self.try_acquire(scopes, lease_ttl).await? {
                return Ok(Some(lease));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            let pause_ms = rand::thread_rng().gen_range(150..400);
            tokio::time::sleep(Duration::from_millis(pause_ms)).await;
        }
    }

    pub async fn release(&self, lease: Lease) -> Result<(), RateLimitError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE rl_gates g SET held = GREATEST(g.held - 1, 0), updated_at = now()
             FROM rl_leases l
             WHERE l.id = $1 AND l.scope = g.scope",
        )
        .bind(lease.id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM rl_leases WHERE id = $1")
            .bind(lease.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Return permits held by leases whose worker died. Run periodically.
    pub async fn reclaim_expired_leases(&self) -> Result<u64, RateLimitError> {
        let reclaimed = sqlx::query(
            "WITH expired AS (
                 DELETE FROM rl_leases WHERE expires_at < now() RETURNING scope
             ), counted AS (
                 SELECT scope, COUNT(*)::INT AS cnt FROM expired GROUP BY scope
             )
             UPDATE rl_gates g SET held = GREATEST(g.held - c.cnt, 0), updated_at = now()
             FROM counted c WHERE g.scope = c.scope",
        )
        .execute(&self.pool)
        .await?;
        Ok(reclaimed.rows_affected())
    }

    /// Take one token from the scope's bucket, refilling lazily from the
    /// elapsed wall time. On an empty bucket, returns the jittered instant
    /// at which a token will exist.
    pub async fn consume(
        &self,
        scope: &str,
        rps: f64,
        burst: f64,
    ) -> Result<Consume, RateLimitError> {
        let taken: Option<f64> = sqlx::query_scalar(
            "INSERT INTO rl_buckets (scope, tokens, refill_rps, burst, refilled_at)
             VALUES ($1, $3 - 1.0, $2, $3, now())
             ON CONFLICT (scope) DO UPDATE SET
               tokens = LEAST(rl_buckets.tokens
                              + EXTRACT(EPOCH FROM (now() - rl_buckets.refilled_at)) * $2,
                              $3) - 1.0,
               refill_rps = $2, burst = $3, refilled_at = now()
               WHERE LEAST(rl_buckets.tokens
                           + EXTRACT(EPOCH FROM (now() - rl_buckets.refilled_at)) * $2,
                           $3) >= 1.0
             RETURNING tokens",
        )
        .bind(scope)
        .bind(rps)
        .bind(burst)
        .fetch_optional(&self.pool)
        .await?;
        if taken.is_some() {
            return Ok(Consume::Ok);
        }
        let level: Option<(f64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT tokens, refilled_at FROM rl_buckets WHERE scope = $1",
        )
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;
        let (tokens, refilled_at) = level.unwrap_or((0.0, Utc::now()));
        let elapsed = (Utc::now() - refilled_at).num_milliseconds() as f64 / 1000.0;
        let available = bucket::refill(tokens, burst, rps, elapsed);
        let factor = rand::thread_rng().gen_range(0.8..1.2);
        let wait = bucket::jittered(bucket::wait_for_one(available, rps), factor);
        Ok(Consume::WaitUntil(
            Utc::now() + chrono::Duration::milliseconds((wait * 1000.0) as i64),
        ))
    }

    /// Record a throttle signal (403/429, WAF). Doubles per repeat strike,
    /// capped at `max`. `base` should already carry the caller's jitter.
    pub async fn strike_cooloff(
        &self,
        scope: &str,
        base: Duration,
        max: Duration,
    ) -> Result<DateTime<Utc>, RateLimitError> {
        let until: DateTime<Utc> = sqlx::query_scalar(
            "INSERT INTO rl_cooloffs (scope, until, strikes)
             VALUES ($1, now() + make_interval(secs => $2), 1)
             ON CONFLICT (scope) DO UPDATE SET
               strikes = rl_cooloffs.strikes + 1,
               until = now() + make_interval(secs =>
                 LEAST($2 * POWER(2::double precision, LEAST(rl_cooloffs.strikes, 16)), $3)),
               updated_at = now()
             RETURNING until",
        )
        .bind(scope)
        .bind(base.as_secs_f64())
        .bind(max.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;
        Ok(until)
    }

    /// Install an exact cool-off horizon, used for `Retry-After` overrides.
    /// Never shortens an already-longer cool-off.
    pub async fn cooloff_until(
        &self,
        scope: &str,
        until: DateTime<Utc>,
    ) -> Result<(), RateLimitError> {
        sqlx::query(
            "INSERT INTO rl_cooloffs (scope, until, strikes) VALUES ($1, $2, 1)
             ON CONFLICT (scope) DO UPDATE SET
               until = GREATEST(rl_cooloffs.until, $2), updated_at = now()",
        )
        .bind(scope)
        .bind(until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn active_cooloff(
        &self,
        scope: &str,
    ) -> Result<Option<DateTime<Utc>>, RateLimitError> {
        let until: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT until FROM rl_cooloffs WHERE scope = $1 AND until > now()",
        )
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;
        Ok(until)
    }

    /// Forget strikes for a scope after sustained success.
    pub async fn reset_cooloff(&self, scope: &str) -> Result<(), RateLimitError> {
        sqlx::query("DELETE FROM rl_cooloffs WHERE scope = $1")
            .bind(scope)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
