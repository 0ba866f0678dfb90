//! The crawl stage: seed-path enumeration, bounded link discovery, source
//! persistence, and candidate extraction for one domain of a run.

use common_queue::TaskError;
use common_store::normalize::{normalize_domain, normalize_email};
use common_store::{EmailInput, PersonInput, ResolutionInput};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};
use url::Url;

use common_store::jobs::AutodiscoveryJob;

use crate::extract::{Candidate, ExtractHints, ExtractorKind};
use crate::fetch::FetchReason;
use crate::title::{icp_score, normalize_title};
use crate::CrawlerCtx;

/// Tiered seed paths most likely to surface people, crawled in order
/// before any discovered links.
const SEED_PATHS: &[&str] = &["/", "/about", "/team", "/contact", "/people", "/leadership"];

const LINK_KEYWORDS: &[&str] =
    &["team", "about", "people", "leadership", "contact", "staff", "management", "company"];

static LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)href\s*=\s*["']([^"'#]+)["']"#).unwrap());

static GENERIC_LOCALPARTS: &[&str] = &[
    "info", "contact", "hello", "sales", "support", "admin", "office", "team",
    "careers", "jobs", "press", "marketing", "help", "mail", "enquiries", "hr",
];

pub fn is_generic_localpart(email: &str) -> bool {
    email
        .split('@')
        .next()
        .map(|local| GENERIC_LOCALPARTS.contains(&local))
        .unwrap_or(false)
}

#[derive(Debug, Default)]
pub struct CrawlOutcome {
    pub pages_fetched: usize,
    pub pages_stored: usize,
    pub people_found: usize,
    pub emails_found: usize,
}

pub async fn run_autodiscovery(
    ctx: &CrawlerCtx,
    job: &AutodiscoveryJob,
) -> Result<CrawlOutcome, TaskError> {
    let domain = normalize_domain(&job.domain)
        .map_err(|e| TaskError::fatal(format!("invalid domain {}: {e}", job.domain)))?;

    if ctx
        .store
        .is_domain_suppressed(job.tenant_id, &domain)
        .await
        .map_err(|e| TaskError::retryable(e.to_string()))?
    {
        ctx.store
            .record_run_event(job.run_id, "crawl", Some(&domain), "domain_suppressed", None)
            .await
            .ok();
        info!(%domain, run_id = %job.run_id, "domain suppressed, skipping crawl");
        return Ok(CrawlOutcome::default());
    }

    let company = ctx
        .store
        .get_company(job.tenant_id, job.company_id)
        .await
        .map_err(|e| TaskError::retryable(e.to_string()))?
        .ok_or_else(|| TaskError::fatal(format!("company {} missing", job.company_id)))?;

    if company.official_domain.is_none() {
        ctx.store
            .set_official_domain(job.tenant_id, job.company_id, &domain, 100, "supplied")
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;
        ctx.store
            .insert_resolution(
                job.tenant_id,
                Some(job.company_id),
                &ResolutionInput {
                    chosen_domain: domain.clone(),
                    method: Some("supplied".to_string()),
                    confidence: Some(100),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;
    }

    if !job.force_discovery {
        let existing = ctx
            .store
            .count_people(job.tenant_id, job.company_id)
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;
        if existing > 0 {
            ctx.store
                .record_run_event(job.run_id, "crawl", Some(&domain), "skipped_existing", None)
                .await
                .ok();
            debug!(%domain, existing, "people already present, skipping discovery");
            return Ok(CrawlOutcome::default());
        }
    }

    let outcome = crawl_domain(ctx, job, &domain).await?;

    ctx.store
        .record_run_event(
            job.run_id,
            "crawl",
            Some(&domain),
            "crawl_done",
            Some(&format!(
                "pages={} people={} emails={}",
                outcome.pages_stored, outcome.people_found, outcome.emails_found
            )),
        )
        .await
        .ok();
    if outcome.emails_found > 0 {
        ctx.store
            .add_emails_found(job.run_id, outcome.emails_found as i32)
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;
    }
    Ok(outcome)
}

async fn crawl_domain(
    ctx: &CrawlerCtx,
    job: &AutodiscoveryJob,
    domain: &str,
) -> Result<CrawlOutcome, TaskError> {
    let base = Url::parse(&format!("https://{domain}/"))
        .map_err(|e| TaskError::fatal(format!("bad base url: {e}")))?;
    let hints = ExtractHints { ai_enabled: job.ai_enabled };

    let mut outcome = CrawlOutcome::default();
    let mut throttled = 0usize;
    let mut visited: HashSet<String> = HashSet::new();
    let mut frontier: VecDeque<(Url, usize)> = SEED_PATHS
        .iter()
        .filter_map(|p| base.join(p).ok())
        .map(|u| (u, 0))
        .collect();
    let mut candidates: Vec<Candidate> = Vec::new();

    while let Some((url, depth)) = frontier.pop_front() {
        if outcome.pages_fetched >= ctx.config.crawl_max_pages_per_domain {
            break;
        }
        if !visited.insert(url.path().to_string()) {
            continue;
        }
        if ctx
            .queue
            .group_cancelled(job.run_id)
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?
        {
            return Err(TaskError::fatal("run_cancelled"));
        }

        let fetched = ctx.fetcher.fetch(url.as_str()).await;
        ctx.metrics
            .fetches_total
            .with_label_values(&[fetched.reason.as_str()])
            .inc();
        ctx.metrics
            .fetch_duration_seconds
            .observe(fetched.elapsed_ms as f64 / 1000.0);
        outcome.pages_fetched += 1;

        match fetched.reason {
            FetchReason::BlockedByRobots => {
                ctx.store
                    .record_run_event(job.run_id, "crawl", Some(domain), "robots_blocked",
                        Some(url.path()))
                    .await
                    .ok();
                continue;
            }
            FetchReason::Throttled => {
                throttled += 1;
                continue;
            }
            reason if !reason.usable() => continue,
            _ => {}
        }
        if fetched.body.is_empty() {
            continue;
        }

        ctx.store
            .insert_source(job.tenant_id, job.company_id, url.as_str(), &fetched.body)
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;
        outcome.pages_stored += 1;
        ctx.metrics
            .pages_stored_total
            .with_label_values(&[&job.tenant_id.to_string()])
            .inc();

        candidates.extend(ctx.extractor.extract(&fetched.body, url.as_str(), &hints));

        if depth < ctx.config.crawl_max_depth {
            for link in discover_links(&fetched.body, &base) {
                if !visited.contains(link.path()) {
                    frontier.push_back((link, depth + 1));
                }
            }
        }
    }

    if outcome.pages_stored == 0 && throttled > 0 {
        return Err(TaskError::retryable("host_throttled"));
    }

    persist_candidates(ctx, job, candidates, &mut outcome).await?;

    if job.ai_enabled && ctx.extractor.kind() == ExtractorKind::Ai {
        ctx.store
            .merge_company_attrs(
                job.tenant_id,
                job.company_id,
                &serde_json::json!({ "ai_people_extracted": true }),
            )
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;
    }
    Ok(outcome)
}

async fn persist_candidates(
    ctx: &CrawlerCtx,
    job: &AutodiscoveryJob,
    candidates: Vec<Candidate>,
    outcome: &mut CrawlOutcome,
) -> Result<(), TaskError> {
    for candidate in candidates {
        let person_id = match candidate_person_input(&candidate) {
            Some(input) => {
                let id = ctx
                    .store
                    .upsert_person(job.tenant_id, job.company_id, &input)
                    .await
                    .map_err(|e| TaskError::retryable(e.to_string()))?;
                outcome.people_found += 1;
                ctx.metrics
                    .people_extracted_total
                    .with_label_values(&[&job.tenant_id.to_string()])
                    .inc();
                Some(id)
            }
            None => None,
        };

        if let Some(raw_email) = &candidate.email {
            let Ok(email) = normalize_email(raw_email) else { continue };
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
                        email: email.clone(),
                        person_id,
                        is_published: true,
                        is_generic: is_generic_localpart(&email),
                        source_url: Some(candidate.source_url.clone()),
                    },
                )
                .await
                .map_err(|e| TaskError::retryable(e.to_string()))?;
            outcome.emails_found += 1;
        }
    }
    Ok(())
}

fn candidate_person_input(candidate: &Candidate) -> Option<PersonInput> {
    let full = candidate.full.clone().or_else(|| {
        match (&candidate.first, &candidate.last) {
            (Some(f), Some(l)) => Some(format!("{f} {l}")),
            _ => None,
        }
    })?;
    let normalized = candidate.title.as_deref().map(normalize_title);
    Some(PersonInput {
        first_name: candidate.first.clone(),
        last_name: candidate.last.clone(),
        full_name: full,
        title: candidate.title.clone(),
        title_norm: normalized.as_ref().map(|n| n.title_norm.clone()),
        role_family: normalized.as_ref().map(|n| n.role_family.as_str().to_string()),
        seniority: normalized.as_ref().map(|n| n.seniority.as_str().to_string()),
        source_url: Some(candidate.source_url.clone()),
        icp_score: normalized.as_ref().map(|n| icp_score(n.role_family, n.seniority)),
    })
}

/// Same-host links whose path mentions a people-ish keyword.
pub fn discover_links(html: &str, base: &Url) -> Vec<Url> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut links = Vec::new();
    for caps in LINK_RE.captures_iter(html) {
        let raw = caps[1].trim();
        if raw.starts_with("mailto:") || raw.starts_with("javascript:") || raw.starts_with("tel:") {
            continue;
        }
        let Ok(resolved) = base.join(raw) else { continue };
        if resolved.host_str() != base.host_str() {
            continue;
        }
        let path = resolved.path().to_lowercase();
        if !LINK_KEYWORDS.iter().any(|k| path.contains(k)) {
            continue;
        }
        if seen.insert(path) {
            links.push(resolved);
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_localparts_flagged() {
        assert!(is_generic_localpart("info@example.com"));
        assert!(is_generic_localpart("sales@example.com"));
        assert!(!is_generic_localpart("jane.doe@example.com"));
    }

    #[test]
    fn link_discovery_same_host_people_paths_only() {
        let base = Url::parse("https://example.com/").unwrap();
        let html = r#"
            <a href="/team/">Team</a>
            <a href="/pricing">Pricing</a>
            <a href="https://other.example.net/team">External</a>
            <a href="/about-us">About</a>
            <a href="mailto:x@example.com">mail</a>
            <a href="/team/">Duplicate</a>
        "#;
        let links = discover_links(html, &base);
        let paths: Vec<&str> = links.iter().map(|l| l.path()).collect();
        assert_eq!(paths, vec!["/team/", "/about-us"]);
    }

    #[test]
    fn candidate_without_name_yields_no_person() {
        let candidate = Candidate {
            email: Some("info@example.com".to_string()),
            source_url: "https://example.com/".to_string(),
            ..Default::default()
        };
        assert!(candidate_person_input(&candidate).is_none());
    }

    #[test]
    fn candidate_title_enrichment() {
        let candidate = Candidate {
            first: Some("Jane".to_string()),
            last: Some("Doe".to_string()),
            full: Some("Jane Doe".to_string()),
            title: Some("VP of Sales".to_string()),
            source_url: "https://example.com/team".to_string(),
            ..Default::default()
        };
        let input = candidate_person_input(&candidate).unwrap();
        assert_eq!(input.seniority.as_deref(), Some("vp"));
        assert_eq!(input.role_family.as_deref(), Some("sales"));
        assert!(input.icp_score.unwrap() > 50);
    }
}
