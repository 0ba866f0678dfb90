use anyhow::Context;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub hard_company_limit_24h: i64,
    pub starter_interval: Duration,
    pub finalizer_interval: Duration,
    pub maintenance_interval: Duration,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("invalid value for {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

impl PipelineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8090u16)?,
            hard_company_limit_24h: env_parse("HARD_COMPANY_LIMIT_24H", 1000i64)?,
            starter_interval: Duration::from_millis(env_parse("STARTER_INTERVAL_MS", 2000u64)?),
            finalizer_interval: Duration::from_millis(env_parse("FINALIZER_INTERVAL_MS", 5000u64)?),
            maintenance_interval: Duration::from_millis(env_parse(
                "MAINTENANCE_INTERVAL_MS",
                5000u64,
            )?),
        };
        if config.hard_company_limit_24h < 1 {
            anyhow::bail!("HARD_COMPANY_LIMIT_24H must be at least 1");
        }
        Ok(config)
    }
}
