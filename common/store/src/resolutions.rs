use sqlx::types::Json;
use uuid::Uuid;

use crate::entities::{CatchAllStatus, DomainResolution, MxBehaviorRow};
use crate::{Store, StoreResult};

#[derive(Debug, Clone, Default)]
pub struct ResolutionInput {
    pub chosen_domain: String,
    pub method: Option<String>,
    pub confidence: Option<i32>,
    pub mx_hosts: Vec<String>,
    pub lowest_mx: Option<String>,
    pub no_mx: bool,
}

const RESOLUTION_COLUMNS: &str =
    "id, tenant_id, company_id, chosen_domain, method, confidence, mx_hosts, lowest_mx, \
     no_mx, catch_all_status, catch_all_checked_at, catch_all_localpart, \
     catch_all_smtp_code, resolved_at";

impl Store {
    /// Append-only audit trail; the newest row is authoritative.
    pub async fn insert_resolution(
        &self,
        tenant_id: Uuid,
        company_id: Option<Uuid>,
        input: &ResolutionInput,
    ) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO domain_resolutions
               (tenant_id, company_id, chosen_domain, method, confidence,
                mx_hosts, lowest_mx, no_mx)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(tenant_id)
        .bind(company_id)
        .bind(&input.chosen_domain)
        .bind(&input.method)
        .bind(input.confidence)
        .bind(Json(&input.mx_hosts))
        .bind(&input.lowest_mx)
        .bind(input.no_mx)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn latest_resolution(
        &self,
        tenant_id: Uuid,
        domain: &str,
    ) -> StoreResult<Option<DomainResolution>> {
        let row = sqlx::query_as::<_, DomainResolution>(&format!(
            "SELECT {RESOLUTION_COLUMNS} FROM domain_resolutions
             WHERE tenant_id = $1 AND chosen_domain = $2
             ORDER BY resolved_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Cache the catch-all verdict on the newest resolution row for the
    /// domain.
    pub async fn set_catchall_verdict(
        &self,
        tenant_id: Uuid,
        domain: &str,
        status: CatchAllStatus,
        localpart: Option<&str>,
        smtp_code: Option<i32>,
    ) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE domain_resolutions
             SET catch_all_status = $3, catch_all_checked_at = now(),
                 catch_all_localpart = $4, catch_all_smtp_code = $5
             WHERE id = (
               SELECT id FROM domain_resolutions
               WHERE tenant_id = $1 AND chosen_domain = $2
               ORDER BY resolved_at DESC, id DESC
               LIMIT 1
             )",
        )
        .bind(tenant_id)
        .bind(domain)
        .bind(status.as_str())
        .bind(localpart)
        .bind(smtp_code)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Fold one probe into the per-host behavior record. Last-writer-wins;
    /// small drift between workers is acceptable.
    pub async fn record_mx_probe(
        &self,
        mx_host: &str,
        latency_ms: i32,
        code: Option<i32>,
        category: &str,
        error: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO mx_behavior
               (mx_host, avg_latency_ms, last_code, last_category, last_error, probe_count)
             VALUES ($1, $2, $3, $4, $5, 1)
             ON CONFLICT (mx_host) DO UPDATE SET
               avg_latency_ms = ((mx_behavior.avg_latency_ms::BIGINT * mx_behavior.probe_count
                                  + $2) / (mx_behavior.probe_count + 1))::INT,
               last_code = $3,
               last_category = $4,
               last_error = $5,
               probe_count = mx_behavior.probe_count + 1,
               updated_at = now()",
        )
        .bind(mx_host)
        .bind(latency_ms)
        .bind(code)
        .bind(category)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mx_behavior(&self, mx_host: &str) -> StoreResult<Option<MxBehaviorRow>> {
        let row = sqlx::query_as::<_, MxBehaviorRow>(
            "SELECT mx_host, avg_latency_ms, last_code, last_category, last_error,
                    probe_count, updated_at
             FROM mx_behavior WHERE mx_host = $1",
        )
        .bind(mx_host)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn mx_behavior_snapshot(&self, limit: i64) -> StoreResult<Vec<MxBehaviorRow>> {
        let rows = sqlx::query_as::<_, MxBehaviorRow>(
            "SELECT mx_host, avg_latency_ms, last_code, last_category, last_error,
                    probe_count, updated_at
             FROM mx_behavior ORDER BY updated_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
