//! The generate stage: detect the domain's naming pattern from published
//! addresses, then permute candidates for every person without one.

use common_queue::TaskError;
use common_store::jobs::GenerateEmailsJob;
use common_store::normalize::normalize_domain;
use common_store::EmailInput;
use tracing::{debug, info};

use crate::permute::{detect_pattern, permutations};
use crate::VerifierCtx;

#[derive(Debug, Default)]
pub struct GenerateOutcome {
    pub people_considered: usize,
    pub emails_created: usize,
}

pub async fn run_generate(
    ctx: &VerifierCtx,
    job: &GenerateEmailsJob,
) -> Result<GenerateOutcome, TaskError> {
    let domain = normalize_domain(&job.domain)
        .map_err(|e| TaskError::fatal(format!("invalid domain {}: {e}", job.domain)))?;

    if ctx
        .store
        .is_domain_suppressed(job.tenant_id, &domain)
        .await
        .map_err(|e| TaskError::retryable(e.to_string()))?
    {
        ctx.store
            .record_run_event(job.run_id, "generate", Some(&domain), "domain_suppressed", None)
            .await
            .ok();
        return Ok(GenerateOutcome::default());
    }
    if ctx.resolver.is_freemail(&domain) {
        ctx.store
            .record_run_event(job.run_id, "generate", Some(&domain), "freemail_skipped", None)
            .await
            .ok();
        return Ok(GenerateOutcome::default());
    }

    let samples = ctx
        .store
        .published_email_name_pairs(job.tenant_id, job.company_id)
        .await
        .map_err(|e| TaskError::retryable(e.to_string()))?;
    let detected = detect_pattern(&samples);
    debug!(%domain, samples = samples.len(), pattern = ?detected.map(|p| p.as_str()), "pattern detection");

    let people = ctx
        .store
        .people_without_published_email(job.tenant_id, job.company_id)
        .await
        .map_err(|e| TaskError::retryable(e.to_string()))?;

    let mut outcome = GenerateOutcome { people_considered: people.len(), emails_created: 0 };
    for person in &people {
        let (Some(first), Some(last)) = (&person.first_name, &person.last_name) else {
            continue;
        };
        for email in permutations(first, last, &domain, detected) {
            if ctx
                .store
                .is_email_suppressed(job.tenant_id, &email)
                .await
                .map_err(|e| TaskError::retryable(e.to_string()))?
            {
                continue;
            }
            ctx.store
                .upsert_email(
                    job.tenant_id,
                    job.company_id,
                    &EmailInput {
                        email,
                        person_id: Some(person.id),
                        is_published: false,
                        is_generic: false,
                        source_url: None,
                    },
                )
                .await
                .map_err(|e| TaskError::retryable(e.to_string()))?;
            outcome.emails_created += 1;
        }
    }

    if outcome.emails_created > 0 {
        ctx.store
            .add_emails_found(job.run_id, outcome.emails_created as i32)
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;
    }
    ctx.store
        .record_run_event(
            job.run_id,
            "generate",
            Some(&domain),
            "generate_done",
            Some(&format!(
                "people={} emails={}",
                outcome.people_considered, outcome.emails_created
            )),
        )
        .await
        .ok();
    info!(
        run_id = %job.run_id,
        %domain,
        people = outcome.people_considered,
        emails = outcome.emails_created,
        "generation complete"
    );
    Ok(outcome)
}
