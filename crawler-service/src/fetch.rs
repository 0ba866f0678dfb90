//! Polite one-shot HTTP fetching: robots enforcement first, then host
//! cool-offs, the response cache, crawl-delay pacing, and finally the
//! network with body/content-type caps.

use chrono::{DateTime, Utc};
use common_ratelimit::{Consume, RateLimiter, ScopeLimit};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::config::CrawlerConfig;
use crate::robots::{RobotsCache, RobotsPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReason {
    Ok,
    CachedFresh,
    BlockedByRobots,
    Throttled,
    TooLarge,
    WrongContentType,
    HttpError,
    Timeout,
    DnsError,
}

impl FetchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchReason::Ok => "ok",
            FetchReason::CachedFresh => "cached_fresh",
            FetchReason::BlockedByRobots => "blocked_by_robots",
            FetchReason::Throttled => "throttled",
            FetchReason::TooLarge => "too_large",
            FetchReason::WrongContentType => "wrong_content_type",
            FetchReason::HttpError => "http_error",
            FetchReason::Timeout => "timeout",
            FetchReason::DnsError => "dns_error",
        }
    }

    /// Whether a page body is usable for extraction.
    pub fn usable(&self) -> bool {
        matches!(self, FetchReason::Ok | FetchReason::CachedFresh)
    }
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: Option<u16>,
    pub body: String,
    pub reason: FetchReason,
    pub from_cache: bool,
    pub elapsed_ms: u64,
}

impl FetchResult {
    fn bare(reason: FetchReason, elapsed_ms: u64) -> Self {
        Self { status: None, body: String::new(), reason, from_cache: false, elapsed_ms }
    }
}

#[derive(Clone)]
struct CachedPage {
    status: u16,
    body: String,
    stored_at: DateTime<Utc>,
    ttl: Duration,
}

const ALLOWED_CONTENT_TYPES: &[&str] = &["text/html", "text/plain", "application/xhtml+xml"];

pub struct Fetcher {
    client: reqwest::Client,
    robots: RobotsCache,
    pages: RwLock<HashMap<String, CachedPage>>,
    limiter: RateLimiter,
    config: Arc<CrawlerConfig>,
}

impl Fetcher {
    pub fn new(limiter: RateLimiter, config: Arc<CrawlerConfig>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.http_connect_timeout)
            .timeout(config.http_total_timeout)
            .build()?;
        Ok(Self {
            client,
            robots: RobotsCache::new(),
            pages: RwLock::new(HashMap::new()),
            limiter,
            config,
        })
    }

    /// One polite GET. Robots are consulted before any page request; a
    /// disallowed path is never fetched.
    pub async fn fetch(&self, raw_url: &str) -> FetchResult {
        let started = Instant::now();
        let Ok(url) = Url::parse(raw_url) else {
            return FetchResult::bare(FetchReason::HttpError, 0);
        };
        let Some(host) = url.host_str().map(|h| h.to_string()) else {
            return FetchResult::bare(FetchReason::HttpError, 0);
        };

        if let Ok(Some(until)) = self.limiter.active_cooloff(&host_scope(&host)).await {
            debug!(%host, %until, "host in cool-off, skipping fetch");
            return FetchResult::bare(FetchReason::Throttled, elapsed_ms(started));
        }

        let cache_key = canonical_key(&url);
        if let Some(page) = self.cached_page(&cache_key).await {
            return FetchResult {
                status: Some(page.status),
                body: page.body,
                reason: FetchReason::CachedFresh,
                from_cache: true,
                elapsed_ms: elapsed_ms(started),
            };
        }

        let policy = self.robots_for(&host, url.scheme()).await;
        let path = url.path();
        if !policy.allows(path) {
            return FetchResult::bare(FetchReason::BlockedByRobots, elapsed_ms(started));
        }

        if let Some(reason) = self.pace(&host, policy.crawl_delay()).await {
            return FetchResult::bare(reason, elapsed_ms(started));
        }

        let mut last_reason = FetchReason::HttpError;
        for attempt in 0..=self.config.fetch_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
            match self.fetch_once(&url, &host, &cache_key).await {
                Ok(result) => return finish(result, started),
                Err(retry) => {
                    last_reason = retry;
                    debug!(url = %url, attempt, reason = retry.as_str(), "transient fetch failure");
                }
            }
        }
        FetchResult::bare(last_reason, elapsed_ms(started))
    }

    /// Inner attempt. `Err` carries a retryable reason.
    async fn fetch_once(
        &self,
        url: &Url,
        host: &str,
        cache_key: &str,
    ) -> Result<FetchResult, FetchReason> {
        let response = match self.client.get(url.clone()).send().await {
            Ok(r) => r,
            Err(e) => return Err(classify_request_error(&e)),
        };
        let status = response.status();

        if status.as_u16() == 403 || status.as_u16() == 429 {
            self.install_waf_cooloff(host, response.headers().get(reqwest::header::RETRY_AFTER))
                .await;
            return Ok(FetchResult {
                status: Some(status.as_u16()),
                body: String::new(),
                reason: FetchReason::Throttled,
                from_cache: false,
                elapsed_ms: 0,
            });
        }
        if status.is_server_error() {
            return Err(FetchReason::HttpError);
        }
        if status.is_client_error() {
            return Ok(FetchResult {
                status: Some(status.as_u16()),
                body: String::new(),
                reason: FetchReason::HttpError,
                from_cache: false,
                elapsed_ms: 0,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        if !ALLOWED_CONTENT_TYPES.iter().any(|t| content_type.starts_with(t)) {
            return Ok(FetchResult {
                status: Some(status.as_u16()),
                body: String::new(),
                reason: FetchReason::WrongContentType,
                from_cache: false,
                elapsed_ms: 0,
            });
        }

        let max_age = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_max_age);

        let (body, truncated) = match read_body_capped(response, self.config.fetch_max_body_bytes).await {
            Ok(pair) => pair,
            Err(reason) => return Err(reason),
        };

        let ttl = max_age
            .map(Duration::from_secs)
            .unwrap_or(self.config.fetch_cache_ttl)
            .min(Duration::from_secs(24 * 60 * 60));
        self.store_page(cache_key, status.as_u16(), &body, ttl).await;
        self.limiter.reset_cooloff(&host_scope(host)).await.ok();

        Ok(FetchResult {
            status: Some(status.as_u16()),
            body,
            reason: if truncated { FetchReason::TooLarge } else { FetchReason::Ok },
            from_cache: false,
            elapsed_ms: 0,
        })
    }

    /// Per-domain pacing plus the global gates. Short waits are slept
    /// through; anything past the patience cap surfaces as throttled so the
    /// job re-enters the queue instead of camping on a worker slot.
    ///
    /// Pacing degrades to fail-open when the shared limiter state is
    /// unreachable; robots enforcement never does.
    async fn pace(&self, host: &str, crawl_delay: Option<Duration>) -> Option<FetchReason> {
        let lease = match self
            .limiter
            .acquire(
                &[ScopeLimit::new("global:crawl", self.config.global_max_concurrency)],
                self.config.pace_patience,
                Duration::from_secs(60),
            )
            .await
        {
            Ok(Some(lease)) => Some(lease),
            Ok(None) => return Some(FetchReason::Throttled),
            Err(e) => {
                warn!(error = %e, "rate limiter unavailable, pacing degraded");
                None
            }
        };

        let delay = crawl_delay
            .unwrap_or(self.config.fetch_default_delay)
            .max(self.config.fetch_default_delay);
        let domain_rps = 1.0 / delay.as_secs_f64().max(0.001);
        let deadline = Instant::now() + self.config.pace_patience;
        let result = loop {
            let global = self
                .limiter
                .consume("rps:global", self.config.global_rps, self.config.global_rps.max(1.0))
                .await;
            let domain = match global {
                Ok(Consume::Ok) => {
                    self.limiter.consume(&format!("rps:crawl:{host}"), domain_rps, 1.0).await
                }
                other => other,
            };
            match domain {
                Ok(Consume::Ok) => break None,
                Ok(Consume::WaitUntil(until)) => {
                    let wait = (until - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::from_millis(250));
                    if Instant::now() + wait > deadline {
                        break Some(FetchReason::Throttled);
                    }
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    warn!(error = %e, "rate limiter unavailable, pacing degraded");
                    break None;
                }
            }
        };
        if let Some(lease) = lease {
            self.limiter.release(lease).await.ok();
        }
        result
    }

    async fn robots_for(&self, host: &str, scheme: &str) -> Arc<RobotsPolicy> {
        if let Some(cached) = self.robots.get(host).await {
            return cached.policy;
        }
        let robots_url = format!("{scheme}://{host}/robots.txt");
        let fetched = self.client.get(&robots_url).send().await;
        let (policy, ttl) = match fetched {
            Ok(resp) if resp.status().is_success() => {
                let text = resp.text().await.unwrap_or_default();
                (
                    RobotsPolicy::parse(&text, &self.config.user_agent),
                    self.config.robots_ttl,
                )
            }
            // Missing robots.txt means no restrictions.
            Ok(resp) if resp.status().as_u16() == 404 || resp.status().as_u16() == 410 => {
                (RobotsPolicy::allow_all(), Duration::from_secs(24 * 60 * 60))
            }
            Ok(_) | Err(_) => (RobotsPolicy::deny_all(), self.config.robots_deny_ttl),
        };
        self.robots.put(host, policy, ttl).await
    }

    async fn install_waf_cooloff(
        &self,
        host: &str,
        retry_after: Option<&reqwest::header::HeaderValue>,
    ) {
        let scope = host_scope(host);
        if let Some(until) = retry_after
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()))
        {
            if self.limiter.cooloff_until(&scope, until).await.is_ok() {
                warn!(%host, %until, "honoring Retry-After cool-off");
                return;
            }
        }
        let jitter = rand::thread_rng().gen_range(0.85..1.15);
        let base = Duration::from_secs_f64(15.0 * 60.0 * jitter);
        match self.limiter.strike_cooloff(&scope, base, Duration::from_secs(24 * 60 * 60)).await {
            Ok(until) => warn!(%host, %until, "WAF signal, host cooling off"),
            Err(e) => warn!(%host, error = %e, "failed to install cool-off"),
        }
    }

    async fn cached_page(&self, key: &str) -> Option<CachedPage> {
        let pages = self.pages.read().await;
        let page = pages.get(key)?;
        let age = (Utc::now() - page.stored_at).to_std().ok()?;
        (age < page.ttl).then(|| page.clone())
    }

    async fn store_page(&self, key: &str, status: u16, body: &str, ttl: Duration) {
        let mut pages = self.pages.write().await;
        pages.insert(
            key.to_string(),
            CachedPage { status, body: body.to_string(), stored_at: Utc::now(), ttl },
        );
    }
}

fn finish(mut result: FetchResult, started: Instant) -> FetchResult {
    result.elapsed_ms = elapsed_ms(started);
    result
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn host_scope(host: &str) -> String {
    format!("host:{host}")
}

fn canonical_key(url: &Url) -> String {
    let mut u = url.clone();
    u.set_fragment(None);
    u.to_string()
}

fn classify_request_error(e: &reqwest::Error) -> FetchReason {
    if e.is_timeout() {
        FetchReason::Timeout
    } else if e.is_connect() {
        FetchReason::DnsError
    } else {
        FetchReason::HttpError
    }
}

async fn read_body_capped(
    response: reqwest::Response,
    cap: usize,
) -> Result<(String, bool), FetchReason> {
    let mut body: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut response = response;
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = cap.saturating_sub(body.len());
                if chunk.len() >= remaining {
                    body.extend_from_slice(&chunk[..remaining]);
                    truncated = true;
                    break;
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => return Err(classify_request_error(&e)),
        }
    }
    Ok((String::from_utf8_lossy(&body).into_owned(), truncated))
}

/// `Retry-After` is either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<i64>() {
        return (secs >= 0).then(|| now + chrono::Duration::seconds(secs));
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .filter(|dt| *dt > now)
}

/// The `max-age` directive of a `Cache-Control` header, if present.
pub fn parse_max_age(value: &str) -> Option<u64> {
    for directive in value.split(',') {
        let directive = directive.trim().to_lowercase();
        if let Some(age) = directive.strip_prefix("max-age=") {
            return age.trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_seconds() {
        let now = Utc::now();
        let until = parse_retry_after("120", now).unwrap();
        assert_eq!((until - now).num_seconds(), 120);
        assert!(parse_retry_after("-5", now).is_none());
    }

    #[test]
    fn retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Mon, 01 Jan 2024 00:00:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        let until = parse_retry_after("Mon, 01 Jan 2024 00:30:00 GMT", now).unwrap();
        assert_eq!((until - now).num_minutes(), 30);
        // Dates in the past are ignored.
        assert!(parse_retry_after("Sun, 31 Dec 2023 00:00:00 GMT", now).is_none());
    }

    #[test]
    fn max_age_parsing() {
        assert_eq!(parse_max_age("public, max-age=3600"), Some(3600));
        assert_eq!(parse_max_age("MAX-AGE=60"), Some(60));
        assert_eq!(parse_max_age("no-store"), None);
    }

    #[test]
    fn reason_tokens() {
        assert_eq!(FetchReason::BlockedByRobots.as_str(), "blocked_by_robots");
        assert!(FetchReason::CachedFresh.usable());
        assert!(!FetchReason::Throttled.usable());
    }
}
