use anyhow::Context;
use std::env;
use std::time::Duration;

/// Crawler configuration, read once at bootstrap from the environment.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub worker_count: usize,
    pub user_agent: String,
    pub global_max_concurrency: i32,
    pub global_rps: f64,
    pub fetch_default_delay: Duration,
    pub robots_ttl: Duration,
    pub robots_deny_ttl: Duration,
    pub fetch_cache_ttl: Duration,
    pub fetch_max_body_bytes: usize,
    pub fetch_retries: u32,
    pub crawl_max_pages_per_domain: usize,
    pub crawl_max_depth: usize,
    pub http_connect_timeout: Duration,
    pub http_total_timeout: Duration,
    pub pace_patience: Duration,
    pub job_timeout: Duration,
    pub queue_lease: Duration,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("invalid value for {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default_secs: u64) -> anyhow::Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default_secs)?))
}

impl CrawlerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8091u16)?,
            worker_count: env_parse("CRAWL_WORKERS", 4usize)?,
            user_agent: env::var("CRAWL_USER_AGENT")
                .unwrap_or_else(|_| "leadlift-bot/0.1 (+https://leadlift.dev/bot)".to_string()),
            global_max_concurrency: env_parse("GLOBAL_MAX_CONCURRENCY", 12i32)?,
            global_rps: env_parse("GLOBAL_RPS", 6.0f64)?,
            fetch_default_delay: env_secs("FETCH_DEFAULT_DELAY_SEC", 3)?,
            robots_ttl: env_secs("ROBOTS_TTL_SEC", 3600)?,
            robots_deny_ttl: env_secs("ROBOTS_DENY_TTL_SEC", 300)?,
            fetch_cache_ttl: env_secs("FETCH_CACHE_TTL_SEC", 900)?,
            fetch_max_body_bytes: env_parse("FETCH_MAX_BODY_BYTES", 2 * 1024 * 1024usize)?,
            fetch_retries: env_parse("FETCH_RETRIES", 2u32)?,
            crawl_max_pages_per_domain: env_parse("CRAWL_MAX_PAGES_PER_DOMAIN", 12usize)?,
            crawl_max_depth: env_parse("CRAWL_MAX_DEPTH", 2usize)?,
            http_connect_timeout: env_secs("HTTP_CONNECT_TIMEOUT_SEC", 5)?,
            http_total_timeout: env_secs("HTTP_TOTAL_TIMEOUT_SEC", 30)?,
            pace_patience: env_secs("PACE_PATIENCE_SEC", 30)?,
            job_timeout: env_secs("CRAWL_JOB_TIMEOUT_SEC", 600)?,
            queue_lease: env_secs("QUEUE_LEASE_SEC", 300)?,
        };
        if config.global_max_concurrency <= 0 {
            anyhow::bail!("GLOBAL_MAX_CONCURRENCY must be positive");
        }
        if config.global_rps <= 0.0 {
            anyhow::bail!("GLOBAL_RPS must be positive");
        }
        if config.fetch_max_body_bytes == 0 {
            anyhow::bail!("FETCH_MAX_BODY_BYTES must be positive");
        }
        Ok(config)
    }
}
