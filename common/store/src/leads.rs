use sqlx::types::Json;
use uuid::Uuid;

use crate::entities::{
    Company, EmailRow, Person, VerificationInput, VerificationResult,
};
use crate::{Store, StoreResult};

#[derive(Debug, Clone, Default)]
pub struct PersonInput {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: String,
    pub title: Option<String>,
    pub title_norm: Option<String>,
    pub role_family: Option<String>,
    pub seniority: Option<String>,
    pub source_url: Option<String>,
    pub icp_score: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct EmailInput {
    /// Already normalized (`normalize::normalize_email`).
    pub email: String,
    pub person_id: Option<Uuid>,
    pub is_published: bool,
    pub is_generic: bool,
    pub source_url: Option<String>,
}

impl Store {
    /// Keyed by `(tenant, supplied_domain)` when a domain is supplied, else
    /// `(tenant, name)`. The first writer's `run_id` sticks.
    pub async fn upsert_company(
        &self,
        tenant_id: Uuid,
        run_id: Option<Uuid>,
        name: &str,
        supplied_domain: Option<&str>,
    ) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        let sql = if supplied_domain.is_some() {
            "INSERT INTO companies (id, tenant_id, run_id, name, supplied_domain)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (tenant_id, supplied_domain) WHERE supplied_domain IS NOT NULL
             DO UPDATE SET name = EXCLUDED.name,
                           run_id = COALESCE(companies.run_id, EXCLUDED.run_id)
             RETURNING id"
        } else {
            "INSERT INTO companies (id, tenant_id, run_id, name, supplied_domain)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (tenant_id, name) WHERE supplied_domain IS NULL
             DO UPDATE SET run_id = COALESCE(companies.run_id, EXCLUDED.run_id)
             RETURNING id"
        };
        let id: Uuid = sqlx::query_scalar(sql)
            .bind(id)
            .bind(tenant_id)
            .bind(run_id)
            .bind(name)
            .bind(supplied_domain)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn get_company(&self, tenant_id: Uuid, company_id: Uuid) -> StoreResult<Option<Company>> {
        let company = sqlx::query_as::<_, Company>(
            "SELECT id, tenant_id, run_id, name, supplied_domain, official_domain,
                    official_confidence, official_source, attrs, created_at
             FROM companies WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(company)
    }

    /// Set once per confident resolution: a non-null `official_domain` is
    /// never overwritten.
    pub async fn set_official_domain(
        &self,
        tenant_id: Uuid,
        company_id: Uuid,
        domain: &str,
        confidence: i32,
        source: &str,
    ) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE companies
             SET official_domain = $3, official_confidence = $4, official_source = $5
             WHERE tenant_id = $1 AND id = $2 AND official_domain IS NULL",
        )
        .bind(tenant_id)
        .bind(company_id)
        .bind(domain)
        .bind(confidence)
        .bind(source)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Shallow-merge a patch into `attrs`; existing keys are overwritten,
    /// others accumulate.
    pub async fn merge_company_attrs(
        &self,
        tenant_id: Uuid,
        company_id: Uuid,
        patch: &serde_json::Value,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE companies SET attrs = attrs || $3
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(company_id)
        .bind(Json(patch))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_source(
        &self,
        tenant_id: Uuid,
        company_id: Uuid,
        url: &str,
        html: &str,
    ) -> StoreResult<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO sources (id, tenant_id, company_id, url, html)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (tenant_id, company_id, url)
             DO UPDATE SET html = EXCLUDED.html, fetched_at = now()
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(company_id)
        .bind(url)
        .bind(html)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Keyed by `(tenant, company, lower(full_name))`; title and source
    /// fields fill in blanks rather than clobbering earlier extractions.
    pub async fn upsert_person(
        &self,
        tenant_id: Uuid,
        company_id: Uuid,
        input: &PersonInput,
    ) -> StoreResult<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO people (id, tenant_id, company_id, first_name, last_name, full_name,
                                 title, title_norm, role_family, seniority, source_url, icp_score)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (tenant_id, company_id, lower(full_name)) DO UPDATE SET
               first_name = COALESCE(people.first_name, EXCLUDED.first_name),
               last_name = COALESCE(people.last_name, EXCLUDED.last_name),
               title = COALESCE(EXCLUDED.title, people.title),
               title_norm = COALESCE(EXCLUDED.title_norm, people.title_norm),
               role_family = COALESCE(EXCLUDED.role_family, people.role_family),
               seniority = COALESCE(EXCLUDED.seniority, people.seniority),
               source_url = COALESCE(people.source_url, EXCLUDED.source_url),
               icp_score = COALESCE(EXCLUDED.icp_score, people.icp_score)
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(company_id)
        .bind(&input.first_name)
        .bind(&input.last_name)
        .bind(&input.full_name)
        .bind(&input.title)
        .bind(&input.title_norm)
        .bind(&input.role_family)
        .bind(&input.seniority)
        .bind(&input.source_url)
        .bind(input.icp_score)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn count_people(&self, tenant_id: Uuid, company_id: Uuid) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM people WHERE tenant_id = $1 AND company_id = $2",
        )
        .bind(tenant_id)
        .bind(company_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn people_without_published_email(
        &self,
        tenant_id: Uuid,
        company_id: Uuid,
    ) -> StoreResult<Vec<Person>> {
        let people = sqlx::query_as::<_, Person>(
            "SELECT id, tenant_id, company_id, first_name, last_name, full_name, title,
                    title_norm, role_family, seniority, source_url, icp_score
             FROM people p
             WHERE p.tenant_id = $1 AND p.company_id = $2
               AND NOT EXISTS (
                 SELECT 1 FROM emails e
                 WHERE e.tenant_id = p.tenant_id AND e.person_id = p.id AND e.is_published
               )
             ORDER BY p.created_at",
        )
        .bind(tenant_id)
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(people)
    }

    /// Keyed by `(tenant, lower(email))`. A published flag is sticky: second
    /// writers never downgrade `is_published = true`.
    pub async fn upsert_email(
        &self,
        tenant_id: Uuid,
        company_id: Uuid,
        input: &EmailInput,
    ) -> StoreResult<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO emails (id, tenant_id, company_id, person_id, email,
                                 is_published, is_generic, source_url)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (tenant_id, lower(email)) DO UPDATE SET
               is_published = emails.is_published OR EXCLUDED.is_published,
               person_id = COALESCE(emails.person_id, EXCLUDED.person_id),
               source_url = COALESCE(emails.source_url, EXCLUDED.source_url)
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(company_id)
        .bind(input.person_id)
        .bind(&input.email)
        .bind(input.is_published)
        .bind(input.is_generic)
        .bind(&input.source_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn published_emails(
        &self,
        tenant_id: Uuid,
        company_id: Uuid,
    ) -> StoreResult<Vec<EmailRow>> {
        let rows = sqlx::query_as::<_, EmailRow>(
            "SELECT id, tenant_id, company_id, person_id, email, is_published, is_generic, source_url
             FROM emails
             WHERE tenant_id = $1 AND company_id = $2 AND is_published",
        )
        .bind(tenant_id)
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Published emails with the owning person's name parts, the input to
    /// domain pattern detection.
    pub async fn published_email_name_pairs(
        &self,
        tenant_id: Uuid,
        company_id: Uuid,
    ) -> StoreResult<Vec<(Option<String>, Option<String>, String)>> {
        let rows: Vec<(Option<String>, Option<String>, String)> = sqlx::query_as(
            "SELECT p.first_name, p.last_name, e.email
             FROM emails e
             JOIN people p ON p.id = e.person_id AND p.tenant_id = e.tenant_id
             WHERE e.tenant_id = $1 AND e.company_id = $2 AND e.is_published",
        )
        .bind(tenant_id)
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Emails whose latest verification is missing or inconclusive. These
    /// are the probe candidates for the verify stage.
    pub async fn emails_needing_verification(
        &self,
        tenant_id: Uuid,
        company_id: Uuid,
    ) -> StoreResult<Vec<EmailRow>> {
        let rows = sqlx::query_as::<_, EmailRow>(
            "SELECT e.id, e.tenant_id, e.company_id, e.person_id, e.email,
                    e.is_published, e.is_generic, e.source_url
             FROM emails e
             LEFT JOIN LATERAL (
               SELECT v.verify_status FROM verification_results v
               WHERE v.tenant_id = e.tenant_id AND v.email_id = e.id
               ORDER BY COALESCE(v.verified_at, v.checked_at) DESC, v.id DESC
               LIMIT 1
             ) latest ON TRUE
             WHERE e.tenant_id = $1 AND e.company_id = $2
               AND (latest.verify_status IS NULL OR latest.verify_status = 'unknown_timeout')
             ORDER BY e.created_at",
        )
        .bind(tenant_id)
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_email(&self, tenant_id: Uuid, email_id: Uuid) -> StoreResult<Option<EmailRow>> {
        let row = sqlx::query_as::<_, EmailRow>(
            "SELECT id, tenant_id, company_id, person_id, email, is_published, is_generic, source_url
             FROM emails WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(email_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Unconditional append. Rows are retained for audit; the latest view
    /// disambiguates.
    pub async fn append_verification(
        &self,
        tenant_id: Uuid,
        email_id: Uuid,
        input: &VerificationInput,
    ) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO verification_results
               (tenant_id, email_id, mx_host, smtp_code, smtp_reason,
                fallback_status, fallback_at, verify_status, verify_reason,
                verified_mx, verified_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING id",
        )
        .bind(tenant_id)
        .bind(email_id)
        .bind(&input.mx_host)
        .bind(input.smtp_code)
        .bind(&input.smtp_reason)
        .bind(input.fallback_status.map(|s| s.as_str()))
        .bind(input.fallback_at)
        .bind(input.verify_status.as_str())
        .bind(&input.verify_reason)
        .bind(&input.verified_mx)
        .bind(input.verified_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Newest row by `COALESCE(verified_at, checked_at)`, ties broken by id.
    pub async fn latest_verification(
        &self,
        tenant_id: Uuid,
        email_id: Uuid,
    ) -> StoreResult<Option<VerificationResult>> {
        let row = sqlx::query_as::<_, VerificationResult>(
            "SELECT id, tenant_id, email_id, mx_host, smtp_code, smtp_reason, checked_at,
                    fallback_status, fallback_at, verify_status, verify_reason,
                    verified_mx, verified_at
             FROM verification_results
             WHERE tenant_id = $1 AND email_id = $2
             ORDER BY COALESCE(verified_at, checked_at) DESC, id DESC
             LIMIT 1",
        )
        .bind(tenant_id)
        .bind(email_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn is_email_suppressed(&self, tenant_id: Uuid, email: &str) -> StoreResult<bool> {
        let hit: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM suppressions
             WHERE tenant_id = $1 AND lower(email) = lower($2) LIMIT 1",
        )
        .bind(tenant_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hit.is_some())
    }

    pub async fn is_domain_suppressed(&self, tenant_id: Uuid, domain: &str) -> StoreResult<bool> {
        let hit: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM suppressions
             WHERE tenant_id = $1 AND lower(domain) = lower($2) LIMIT 1",
        )
        .bind(tenant_id)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hit.is_some())
    }

    pub async fn add_suppression(
        &self,
        tenant_id: Uuid,
        email: Option<&str>,
        domain: Option<&str>,
        reason: &str,
        source: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO suppressions (tenant_id, email, domain, reason, source)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(tenant_id)
        .bind(email)
        .bind(domain)
        .bind(reason)
        .bind(source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delivery-confirmation check backing the catch-all upgrade path.
    pub async fn has_confirmed_delivery(
        &self,
        tenant_id: Uuid,
        email_id: Uuid,
    ) -> StoreResult<bool> {
        let hit: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM delivery_confirmations
             WHERE tenant_id = $1 AND email_id = $2",
        )
        .bind(tenant_id)
        .bind(email_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hit.is_some())
    }
}
