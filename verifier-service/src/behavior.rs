//! Per-MX-host behavior tracking behind an explicit sink interface. The
//! prober reports every conversation here and reads hints back to adapt
//! its timeouts; the Postgres-backed sink is the production implementation.

use async_trait::async_trait;
use common_store::Store;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BehaviorHint {
    pub tarpit: bool,
    pub fast: bool,
}

#[async_trait]
pub trait BehaviorSink: Send + Sync {
    async fn record_probe(
        &self,
        mx_host: &str,
        latency_ms: u64,
        code: Option<u16>,
        category: &str,
        error: Option<&str>,
    );
    async fn hint(&self, mx_host: &str) -> BehaviorHint;
}

const TARPIT_AVG_MS: i32 = 5_000;
const FAST_AVG_MS: i32 = 800;
const MIN_SAMPLES_FOR_HINT: i64 = 3;

pub struct PgBehaviorSink {
    store: Store,
}

impl PgBehaviorSink {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BehaviorSink for PgBehaviorSink {
    async fn record_probe(
        &self,
        mx_host: &str,
        latency_ms: u64,
        code: Option<u16>,
        category: &str,
        error: Option<&str>,
    ) {
        let latency = latency_ms.min(i32::MAX as u64) as i32;
        if let Err(e) = self
            .store
            .record_mx_probe(mx_host, latency, code.map(i32::from), category, error)
            .await
        {
            warn!(%mx_host, error = %e, "failed to record MX behavior");
        }
    }

    async fn hint(&self, mx_host: &str) -> BehaviorHint {
        match self.store.mx_behavior(mx_host).await {
            Ok(Some(row)) if row.probe_count >= MIN_SAMPLES_FOR_HINT => BehaviorHint {
                tarpit: row.avg_latency_ms >= TARPIT_AVG_MS,
                fast: row.avg_latency_ms <= FAST_AVG_MS,
            },
            Ok(_) => BehaviorHint::default(),
            Err(e) => {
                warn!(%mx_host, error = %e, "failed to read MX behavior");
                BehaviorHint::default()
            }
        }
    }
}

/// No-op sink for tests and probe-disabled deployments.
pub struct NullBehaviorSink;

#[async_trait]
impl BehaviorSink for NullBehaviorSink {
    async fn record_probe(&self, _: &str, _: u64, _: Option<u16>, _: &str, _: Option<&str>) {}
    async fn hint(&self, _: &str) -> BehaviorHint {
        BehaviorHint::default()
    }
}
