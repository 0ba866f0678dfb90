//! The verify stage: per-domain fan-out plus the per-email probe workflow
//! that drives resolve -> catch-all -> RCPT -> classify -> append.

use chrono::Utc;
use common_queue::{EnqueueOpts, TaskError};
use common_ratelimit::{Consume, Lease, ScopeLimit};
use common_store::jobs::{ProbeEmailJob, VerifyDomainJob, VerifyTask, QUEUE_VERIFY};
use common_store::normalize::{email_domain, normalize_domain};
use common_store::{CatchAllStatus, FallbackStatus, VerificationInput, VerifyStatus};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::catchall::{catchall_status, CatchAllVerdict};
use crate::classify::{classify, ClassifierInput, SmtpObservation, Verdict};
use crate::mx::MxOutcome;
use crate::smtp::{ProbeCategory, ProbeOutcome};
use crate::VerifierCtx;

/// Enumerate probe candidates for the domain and fan out one probe job per
/// email on the verify queue.
pub async fn run_verify_domain(
    ctx: &VerifierCtx,
    job: &VerifyDomainJob,
) -> Result<usize, TaskError> {
    let domain = normalize_domain(&job.domain)
        .map_err(|e| TaskError::fatal(format!("invalid domain {}: {e}", job.domain)))?;

    if ctx
        .store
        .is_domain_suppressed(job.tenant_id, &domain)
        .await
        .map_err(|e| TaskError::retryable(e.to_string()))?
    {
        ctx.store
            .record_run_event(job.run_id, "verify", Some(&domain), "domain_suppressed", None)
            .await
            .ok();
        return Ok(0);
    }

    let candidates = ctx
        .store
        .emails_needing_verification(job.tenant_id, job.company_id)
        .await
        .map_err(|e| TaskError::retryable(e.to_string()))?;

    let mut enqueued = 0usize;
    for email in candidates {
        if let Some(d) = email_domain(&email.email) {
            if ctx.resolver.is_freemail(d) {
                continue;
            }
        }
        if ctx
            .store
            .is_email_suppressed(job.tenant_id, &email.email)
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?
        {
            continue;
        }
        let payload = VerifyTask::ProbeEmail(ProbeEmailJob {
            run_id: job.run_id,
            tenant_id: job.tenant_id,
            company_id: job.company_id,
            email_id: email.id,
            email: email.email.clone(),
            domain: email_domain(&email.email).unwrap_or(&domain).to_string(),
        });
        ctx.queue
            .enqueue(
                QUEUE_VERIFY,
                &serde_json::to_value(&payload)
                    .map_err(|e| TaskError::fatal(format!("unencodable probe job: {e}")))?,
                &[],
                Some(job.run_id),
                Some(&domain),
                EnqueueOpts {
                    max_attempts: Some(ctx.config.verify_max_attempts),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;
        enqueued += 1;
    }

    ctx.store
        .record_run_event(
            job.run_id,
            "verify",
            Some(&domain),
            "verify_fanout",
            Some(&format!("probes={enqueued}")),
        )
        .await
        .ok();
    info!(run_id = %job.run_id, %domain, probes = enqueued, "verify fan-out complete");
    Ok(enqueued)
}

struct ProbePhase {
    catch_all: CatchAllVerdict,
    smtp: Option<ProbeOutcome>,
    probed_host: Option<String>,
}

/// Full verification workflow for one email. `attempts_left` tells the
/// retry policy whether an inconclusive probe may re-enter the queue.
pub async fn run_probe_email(
    ctx: &VerifierCtx,
    job: &ProbeEmailJob,
    attempts_left: bool,
) -> Result<(), TaskError> {
    if ctx
        .queue
        .group_cancelled(job.run_id)
        .await
        .map_err(|e| TaskError::retryable(e.to_string()))?
    {
        return Err(TaskError::fatal("run_cancelled"));
    }

    let email = ctx
        .store
        .get_email(job.tenant_id, job.email_id)
        .await
        .map_err(|e| TaskError::retryable(e.to_string()))?
        .ok_or_else(|| TaskError::fatal(format!("email {} missing", job.email_id)))?;

    if ctx
        .store
        .is_email_suppressed(job.tenant_id, &email.email)
        .await
        .map_err(|e| TaskError::retryable(e.to_string()))?
    {
        debug!(email = %email.email, "suppressed, skipping probe");
        return Ok(());
    }

    if !ctx.config.smtp_probes_enabled {
        let verdict = Verdict {
            status: VerifyStatus::UnknownTimeout,
            reason: "probes_disabled".to_string(),
        };
        finish(ctx, job, &verdict, None, None, None, None).await?;
        return Ok(());
    }

    // MX resolution; freemail domains come back as no_mx without network.
    let mx = match ctx
        .resolver
        .resolve(&ctx.store, job.tenant_id, Some(job.company_id), &job.domain, false)
        .await
    {
        Ok(mx) => mx,
        Err(e) if e.retryable() && attempts_left => {
            return Err(TaskError::retryable(e.to_string()));
        }
        Err(e) if e.retryable() => {
            let verdict = Verdict {
                status: VerifyStatus::UnknownTimeout,
                reason: "dns_error".to_string(),
            };
            warn!(email = %email.email, error = %e, "dns exhausted, settling unknown");
            finish(ctx, job, &verdict, None, None, None, None).await?;
            return Ok(());
        }
        Err(e) => return Err(TaskError::fatal(e.to_string())),
    };
    ctx.metrics
        .mx_resolutions_total
        .with_label_values(&[if mx.no_mx { "no_mx" } else if mx.cached { "cached" } else { "resolved" }])
        .inc();

    if mx.no_mx {
        let verdict = classify(&ClassifierInput { no_mx: true, ..Default::default() });
        finish(ctx, job, &verdict, None, None, None, None).await?;
        return Ok(());
    }

    // All SMTP conversations for this email run under the layered gates.
    let Some(lease) = acquire_gates(ctx, &mx, attempts_left).await? else {
        // Out of attempts and still gated: settle rather than stall the run.
        let verdict = Verdict {
            status: VerifyStatus::UnknownTimeout,
            reason: "rate_limited".to_string(),
        };
        finish(ctx, job, &verdict, None, mx.lowest_mx.clone(), None, None).await?;
        return Ok(());
    };
    let phase = probe_phase(ctx, job, &email.email, &mx).await;
    ctx.limiter.release(lease).await.ok();
    let phase = phase?;

    ctx.metrics
        .catchall_checks_total
        .with_label_values(&[phase.catch_all.status.as_str()])
        .inc();
    if let Some(outcome) = &phase.smtp {
        ctx.metrics
            .probes_total
            .with_label_values(&[outcome.category.as_str()])
            .inc();
        ctx.metrics
            .probe_duration_seconds
            .observe(outcome.elapsed_ms as f64 / 1000.0);
    }

    // Inconclusive probes retry through the queue before any fallback or
    // final verdict; hard_fail and accept are terminal immediately.
    let inconclusive = phase
        .smtp
        .as_ref()
        .map(|o| matches!(o.category, ProbeCategory::TempFail | ProbeCategory::Unknown))
        .unwrap_or(false);
    if inconclusive && phase.catch_all.status != CatchAllStatus::CatchAll && attempts_left {
        let reason = phase
            .smtp
            .as_ref()
            .and_then(|o| o.error.clone())
            .unwrap_or_else(|| "smtp_temp_fail".to_string());
        return Err(TaskError::retryable(reason));
    }

    let fallback_status = if inconclusive && phase.catch_all.status != CatchAllStatus::CatchAll {
        match &ctx.fallback {
            Some(client) => Some(client.check(&email.email).await),
            None => None,
        }
    } else {
        None
    };

    let delivery_confirmed = if phase.catch_all.status == CatchAllStatus::CatchAll {
        ctx.store
            .has_confirmed_delivery(job.tenant_id, job.email_id)
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?
    } else {
        false
    };

    let smtp_obs = phase.smtp.as_ref().map(|o| SmtpObservation {
        category: o.category,
        code: o.code,
        reason: o.error.clone(),
    });
    let verdict = classify(&ClassifierInput {
        no_mx: false,
        catch_all: Some(phase.catch_all.status),
        smtp: smtp_obs,
        fallback: fallback_status,
        delivery_confirmed,
    });

    let probed_host = phase.probed_host.clone().or_else(|| mx.lowest_mx.clone());
    finish(
        ctx,
        job,
        &verdict,
        phase.smtp.as_ref(),
        probed_host,
        fallback_status,
        Some(&phase.catch_all),
    )
    .await?;
    Ok(())
}

/// Take the global and per-MX gates, then a token from the per-MX bucket.
/// `Ok(None)` means rate-limited with no attempts left.
async fn acquire_gates(
    ctx: &VerifierCtx,
    mx: &MxOutcome,
    attempts_left: bool,
) -> Result<Option<Lease>, TaskError> {
    let mx_host = mx.lowest_mx.as_deref().unwrap_or(&mx.domain);
    let scopes = [
        ScopeLimit::new("global:verify", ctx.config.global_max_concurrency),
        ScopeLimit::new(format!("mx:{mx_host}"), ctx.config.per_mx_max_concurrency),
    ];
    let lease = ctx
        .limiter
        .acquire(&scopes, Duration::from_secs(3), Duration::from_secs(120))
        .await
        .map_err(|e| TaskError::retryable(e.to_string()))?;
    let Some(lease) = lease else {
        ctx.metrics.rate_limited_total.with_label_values(&["concurrency"]).inc();
        if attempts_left {
            return Err(TaskError::retryable("rate_limited"));
        }
        return Ok(None);
    };

    // Token bucket: wait out short deficits, hand longer ones back to the
    // queue. Tokens consumed here are never refunded.
    let bucket = format!("rps:mx:{mx_host}");
    let burst = ctx.config.per_mx_rps.max(1.0);
    loop {
        match ctx.limiter.consume(&bucket, ctx.config.per_mx_rps, burst).await {
            Ok(Consume::Ok) => return Ok(Some(lease)),
            Ok(Consume::WaitUntil(until)) => {
                let wait = (until - Utc::now()).to_std().unwrap_or(Duration::from_millis(200));
                if wait <= Duration::from_secs(3) {
                    tokio::time::sleep(wait).await;
                    continue;
                }
                ctx.limiter.release(lease).await.ok();
                ctx.metrics.rate_limited_total.with_label_values(&["rps"]).inc();
                if attempts_left {
                    return Err(TaskError::retryable("rate_limited"));
                }
                return Ok(None);
            }
            Err(e) => {
                ctx.limiter.release(lease).await.ok();
                return Err(TaskError::retryable(e.to_string()));
            }
        }
    }
}

/// Catch-all check plus the RCPT probe. A port-25-blocked MX is terminal
/// for that host only; remaining hosts are tried in preference order.
async fn probe_phase(
    ctx: &VerifierCtx,
    job: &ProbeEmailJob,
    email: &str,
    mx: &MxOutcome,
) -> Result<ProbePhase, TaskError> {
    let catch_all = catchall_status(
        &ctx.store,
        &ctx.prober,
        job.tenant_id,
        mx,
        ctx.config.catchall_ttl,
        false,
    )
    .await
    .map_err(|e| TaskError::retryable(e.to_string()))?;

    let skip_probe =
        catch_all.status == CatchAllStatus::CatchAll && ctx.config.skip_probes_on_catchall;
    if skip_probe {
        return Ok(ProbePhase { catch_all, smtp: None, probed_host: None });
    }

    let mut last: Option<(ProbeOutcome, String)> = None;
    for host in &mx.mx_hosts {
        let outcome = ctx.prober.probe(email, host).await;
        let blocked = outcome.error.as_deref() == Some("tcp25_blocked");
        last = Some((outcome, host.clone()));
        if !blocked {
            break;
        }
        debug!(%host, "port 25 blocked, trying next MX");
    }
    let (smtp, probed_host) = match last {
        Some((outcome, host)) => (Some(outcome), Some(host)),
        None => (None, None),
    };
    Ok(ProbePhase { catch_all, smtp, probed_host })
}

/// Append the VerificationResult row and bump the run's counters. The
/// append is the single effect of a probe; re-running after a terminal
/// verdict adds an identical row without changing the latest value.
async fn finish(
    ctx: &VerifierCtx,
    job: &ProbeEmailJob,
    verdict: &Verdict,
    smtp: Option<&ProbeOutcome>,
    mx_host: Option<String>,
    fallback: Option<FallbackStatus>,
    catch_all: Option<&CatchAllVerdict>,
) -> Result<(), TaskError> {
    let conclusive = matches!(
        verdict.status,
        VerifyStatus::Valid | VerifyStatus::Invalid | VerifyStatus::RiskyCatchAll
    );
    let smtp_reason = smtp.map(|o| {
        if o.message.is_empty() {
            o.error.clone().unwrap_or_default()
        } else {
            o.message.clone()
        }
    });
    let input = VerificationInput {
        mx_host: mx_host.clone(),
        smtp_code: smtp.and_then(|o| o.code).map(i32::from),
        smtp_reason,
        fallback_status: fallback,
        fallback_at: fallback.map(|_| Utc::now()),
        verify_status: verdict.status,
        verify_reason: verdict.reason.clone(),
        verified_mx: conclusive.then(|| mx_host.clone()).flatten(),
        verified_at: conclusive.then(Utc::now),
    };
    ctx.store
        .append_verification(job.tenant_id, job.email_id, &input)
        .await
        .map_err(|e| TaskError::retryable(e.to_string()))?;
    ctx.store
        .record_verification_progress(job.run_id, verdict.status)
        .await
        .map_err(|e| TaskError::retryable(e.to_string()))?;
    ctx.metrics
        .verifications_total
        .with_label_values(&[verdict.status.as_str()])
        .inc();
    info!(
        email_id = %job.email_id,
        status = verdict.status.as_str(),
        reason = %verdict.reason,
        catch_all = ?catch_all.map(|c| c.status.as_str()),
        "verification appended"
    );
    Ok(())
}
