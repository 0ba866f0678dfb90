use std::sync::Arc;

use common_observability::PipelineMetrics;
use common_queue::JobQueue;
use common_ratelimit::RateLimiter;
use common_store::Store;

pub mod app;
pub mod config;
pub mod orchestrator;
pub mod sweeps;

use config::PipelineConfig;

/// Shared orchestrator context: config, store, queue, limiter, metrics.
pub struct PipelineCtx {
    pub store: Store,
    pub queue: JobQueue,
    pub limiter: RateLimiter,
    pub metrics: PipelineMetrics,
    pub config: Arc<PipelineConfig>,
}
