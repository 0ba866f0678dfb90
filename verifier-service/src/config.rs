use anyhow::Context;
use std::collections::HashSet;
use std::env;
use std::time::Duration;

/// Verifier configuration, read once at bootstrap from the environment.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub worker_count: usize,
    pub smtp_probes_enabled: bool,
    pub smtp_helo_domain: String,
    pub smtp_mail_from: String,
    pub smtp_port: u16,
    pub smtp_connect_timeout: Duration,
    pub smtp_command_timeout: Duration,
    pub smtp_preflight_timeout: Duration,
    pub dns_timeout: Duration,
    pub mx_cache_ttl: Duration,
    pub catchall_ttl: Duration,
    pub verify_max_attempts: i32,
    pub global_max_concurrency: i32,
    pub global_rps: f64,
    pub per_mx_max_concurrency: i32,
    pub per_mx_rps: f64,
    pub skip_probes_on_catchall: bool,
    pub third_party_verify_url: Option<String>,
    pub third_party_verify_api_key: Option<String>,
    pub freemail_denylist_extra: HashSet<String>,
    pub probe_job_timeout: Duration,
    pub stage_job_timeout: Duration,
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

fn env_millis(key: &str, default_ms: u64) -> anyhow::Result<Duration> {
    Ok(Duration::from_millis(env_parse(key, default_ms)?))
}

impl VerifierConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let smtp_probes_enabled = env_parse("SMTP_PROBES_ENABLED", true)?;
        let smtp_helo_domain = env::var("SMTP_HELO_DOMAIN").unwrap_or_default();
        if smtp_probes_enabled && smtp_helo_domain.is_empty() {
            anyhow::bail!("SMTP_HELO_DOMAIN must be set when probes are enabled");
        }
        let smtp_mail_from = env::var("SMTP_MAIL_FROM")
            .unwrap_or_else(|_| format!("bounce@{smtp_helo_domain}"));

        let freemail_denylist_extra = env::var("FREEMAIL_DENYLIST")
            .unwrap_or_default()
            .split(',')
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();

        let config = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8092u16)?,
            worker_count: env_parse("VERIFY_WORKERS", 4usize)?,
            smtp_probes_enabled,
            smtp_helo_domain,
            smtp_mail_from,
            smtp_port: env_parse("SMTP_PORT", 25u16)?,
            smtp_connect_timeout: env_secs("SMTP_CONNECT_TIMEOUT", 8)?,
            smtp_command_timeout: env_secs("SMTP_COMMAND_TIMEOUT", 15)?,
            smtp_preflight_timeout: env_millis("SMTP_PREFLIGHT_TIMEOUT_MS", 1500)?,
            dns_timeout: env_secs("DNS_TIMEOUT_SEC", 2)?,
            mx_cache_ttl: env_secs("MX_CACHE_TTL_SEC", 24 * 60 * 60)?,
            catchall_ttl: env_secs("CATCHALL_TTL_SEC", 7 * 24 * 60 * 60)?,
            verify_max_attempts: env_parse("VERIFY_MAX_ATTEMPTS", 5i32)?,
            global_max_concurrency: env_parse("GLOBAL_MAX_CONCURRENCY", 12i32)?,
            global_rps: env_parse("GLOBAL_RPS", 6.0f64)?,
            per_mx_max_concurrency: env_parse("PER_MX_MAX_CONCURRENCY", 2i32)?,
            per_mx_rps: env_parse("PER_MX_RPS", 1.0f64)?,
            skip_probes_on_catchall: env_parse("SKIP_PROBES_ON_CATCHALL", false)?,
            third_party_verify_url: env::var("THIRD_PARTY_VERIFY_URL").ok().filter(|v| !v.is_empty()),
            third_party_verify_api_key: env::var("THIRD_PARTY_VERIFY_API_KEY").ok(),
            freemail_denylist_extra,
            probe_job_timeout: env_secs("PROBE_JOB_TIMEOUT_SEC", 45)?,
            stage_job_timeout: env_secs("STAGE_JOB_TIMEOUT_SEC", 300)?,
            queue_lease: env_secs("QUEUE_LEASE_SEC", 300)?,
        };
        if config.verify_max_attempts < 1 {
            anyhow::bail!("VERIFY_MAX_ATTEMPTS must be at least 1");
        }
        if config.per_mx_max_concurrency <= 0 || config.global_max_concurrency <= 0 {
            anyhow::bail!("concurrency caps must be positive");
        }
        if config.per_mx_rps <= 0.0 || config.global_rps <= 0.0 {
            anyhow::bail!("rps limits must be positive");
        }
        Ok(config)
    }
}
