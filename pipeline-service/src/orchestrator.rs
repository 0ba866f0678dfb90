//! Run lifecycle: claim queued runs, validate and fan out per-domain stage
//! chains, recompute progress, and finalize when every domain settles.
//!
//! Stage ordering is data, not control flow: the generate and verify jobs
//! are enqueued up front with `depends_on` pointing at their predecessor,
//! and the queue holds them back until the dependency is done.

use common_queue::EnqueueOpts;
use common_store::jobs::{
    AutodiscoveryJob, GenerateEmailsJob, VerifyDomainJob, VerifyTask, QUEUE_CRAWL,
    QUEUE_GENERATE, QUEUE_VERIFY,
};
use common_store::normalize::normalize_domain;
use common_store::{Run, RunStatus};
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::PipelineCtx;

pub const ERR_COMPANY_LIMIT: &str = "company_limit_exceeded";
pub const ERR_NO_VALID_DOMAINS: &str = "no_valid_domains";

/// Validate and dedupe the submitted domains, preserving order. Invalid
/// entries are dropped, not fatal.
pub fn effective_domains(raw: &[String], company_limit: Option<i64>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for entry in raw {
        let Ok(domain) = normalize_domain(entry) else {
            warn!(%entry, "dropping invalid domain");
            continue;
        };
        if seen.insert(domain.clone()) {
            out.push(domain);
        }
    }
    if let Some(limit) = company_limit {
        out.truncate(limit.max(0) as usize);
    }
    out
}

/// Fan a freshly-claimed run out into per-domain stage chains. The run is
/// already `running`; preconditions that fail here reject the whole run.
pub async fn start_run(ctx: &PipelineCtx, run: &Run) -> anyhow::Result<()> {
    let options = run.options.0.clone();
    let domains = effective_domains(&run.domains.0, options.company_limit);
    if domains.is_empty() {
        ctx.store.reject_run(run.id, ERR_NO_VALID_DOMAINS).await?;
        ctx.metrics.runs_total.with_label_values(&["failed"]).inc();
        return Ok(());
    }

    // The 24-hour company budget is a hard cap checked before any company
    // row is created; crossing it mid-run never kills in-progress work.
    let recent = ctx.store.count_recent_companies(run.tenant_id, 24).await?;
    if recent + domains.len() as i64 > ctx.config.hard_company_limit_24h {
        warn!(
            run_id = %run.id,
            recent,
            requested = domains.len(),
            cap = ctx.config.hard_company_limit_24h,
            "company budget exceeded, rejecting run"
        );
        ctx.store.reject_run(run.id, ERR_COMPANY_LIMIT).await?;
        ctx.store
            .record_run_event(run.id, "run", None, ERR_COMPANY_LIMIT, None)
            .await
            .ok();
        ctx.metrics.runs_total.with_label_values(&["failed"]).inc();
        return Ok(());
    }

    for domain in &domains {
        let company_id = ctx
            .store
            .upsert_company(run.tenant_id, Some(run.id), domain, Some(domain))
            .await?;

        let mut previous: Option<Uuid> = None;
        if options.wants_crawl() {
            let payload = AutodiscoveryJob {
                run_id: run.id,
                tenant_id: run.tenant_id,
                company_id,
                domain: domain.clone(),
                ai_enabled: options.ai_enabled,
                force_discovery: options.force_discovery,
            };
            let job_id = ctx
                .queue
                .enqueue(
                    QUEUE_CRAWL,
                    &serde_json::to_value(&payload)?,
                    &[],
                    Some(run.id),
                    Some(domain),
                    EnqueueOpts::default(),
                )
                .await?;
            previous = Some(job_id);
        }
        if options.wants_generate() {
            let payload = GenerateEmailsJob {
                run_id: run.id,
                tenant_id: run.tenant_id,
                company_id,
                domain: domain.clone(),
            };
            let depends: Vec<Uuid> = previous.into_iter().collect();
            let job_id = ctx
                .queue
                .enqueue(
                    QUEUE_GENERATE,
                    &serde_json::to_value(&payload)?,
                    &depends,
                    Some(run.id),
                    Some(domain),
                    EnqueueOpts::default(),
                )
                .await?;
            previous = Some(job_id);
        }
        if options.wants_verify() {
            let payload = VerifyTask::VerifyDomain(VerifyDomainJob {
                run_id: run.id,
                tenant_id: run.tenant_id,
                company_id,
                domain: domain.clone(),
            });
            let depends: Vec<Uuid> = previous.into_iter().collect();
            ctx.queue
                .enqueue(
                    QUEUE_VERIFY,
                    &serde_json::to_value(&payload)?,
                    &depends,
                    Some(run.id),
                    Some(domain),
                    EnqueueOpts::default(),
                )
                .await?;
        }
    }

    // Committed only after every chain is enqueued: a non-zero
    // domains_total is the fan-out-complete marker the finalizer keys on.
    // Writing it earlier would let a finalizer tick see domains with no
    // jobs yet and count them settled.
    ctx.store.set_effective_domains(run.id, &domains).await?;

    ctx.store
        .record_run_event(
            run.id,
            "run",
            None,
            "run_started",
            Some(&format!("domains={}", domains.len())),
        )
        .await
        .ok();
    info!(run_id = %run.id, domains = domains.len(), mode = options.mode.as_str(), "run started");
    Ok(())
}

/// One finalizer pass over a running run. A domain is settled when no job
/// of its chain remains open; it failed if any of them died. Per-domain
/// failures are isolated and count toward completion.
pub async fn finalize_pass(ctx: &PipelineCtx, run: &Run) -> anyhow::Result<()> {
    if run.domains_total == 0 {
        // Fan-out has not committed yet (domains_total is written after the
        // last chain is enqueued), so job counts would be meaningless here.
        return Ok(());
    }
    let domains = &run.domains.0;
    let mut settled = 0i32;
    for domain in domains {
        let open = ctx.queue.open_jobs_in_group(run.id, Some(domain)).await?;
        if open == 0 {
            settled += 1;
        }
    }
    ctx.store.set_domains_completed(run.id, settled).await?;

    if settled < domains.len() as i32 {
        return Ok(());
    }

    let failed_domains = ctx.queue.failed_group_keys(run.id).await?;
    for domain in &failed_domains {
        ctx.store
            .record_run_event(run.id, "run", Some(domain), "domain_failed", None)
            .await
            .ok();
        ctx.metrics.domains_total.with_label_values(&["failed"]).inc();
    }
    let succeeded_domains = domains.len() - failed_domains.len();
    for _ in 0..succeeded_domains {
        ctx.metrics.domains_total.with_label_values(&["completed"]).inc();
    }

    ctx.store.aggregate_run_counts(run.id).await?;

    let all_failed = !domains.is_empty() && failed_domains.len() == domains.len();
    let (status, error) = if all_failed {
        (RunStatus::Failed, Some("all_domains_failed"))
    } else {
        (RunStatus::Succeeded, None)
    };
    if ctx.store.finalize_run(run.id, status, error).await? {
        ctx.store
            .record_run_event(
                run.id,
                "run",
                None,
                "run_finished",
                Some(&format!(
                    "status={} failed_domains={}",
                    status.as_str(),
                    failed_domains.len()
                )),
            )
            .await
            .ok();
        ctx.metrics.runs_total.with_label_values(&[status.as_str()]).inc();
        info!(run_id = %run.id, status = status.as_str(), "run finalized");
    }
    Ok(())
}

/// Cancel a queued or running run: terminal state plus lazy dead-marking
/// of its remaining jobs. In-flight handlers observe the cancellation at
/// their next suspension point.
pub async fn cancel_run(ctx: &PipelineCtx, run_id: Uuid) -> anyhow::Result<bool> {
    let cancelled = ctx.store.cancel_run(run_id).await?;
    if cancelled {
        ctx.queue.cancel_group(run_id).await?;
        ctx.store
            .record_run_event(run_id, "run", None, "run_cancelled", None)
            .await
            .ok();
        ctx.metrics.runs_total.with_label_values(&["cancelled"]).inc();
        info!(%run_id, "run cancelled");
    }
    Ok(cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn domains_are_normalized_and_deduped() {
        let out = effective_domains(
            &strings(&[
                "Example.com",
                "https://www.example.com/about",
                "other.test",
                "not a domain",
            ]),
            None,
        );
        assert_eq!(out, strings(&["example.com", "other.test"]));
    }

    #[test]
    fn company_limit_truncates_in_order() {
        let out = effective_domains(&strings(&["a.test", "b.test", "c.test"]), Some(2));
        assert_eq!(out, strings(&["a.test", "b.test"]));
    }

    #[test]
    fn all_invalid_yields_empty() {
        let out = effective_domains(&strings(&["not a domain", ""]), None);
        assert!(out.is_empty());
    }
}
