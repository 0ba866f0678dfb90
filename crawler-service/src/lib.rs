use std::sync::Arc;

use common_observability::CrawlerMetrics;
use common_queue::JobQueue;
use common_ratelimit::RateLimiter;
use common_store::Store;

pub mod autodiscovery;
pub mod config;
pub mod extract;
pub mod fetch;
pub mod robots;
pub mod title;
pub mod worker;

use config::CrawlerConfig;
use extract::Extractor;
use fetch::Fetcher;

/// Everything a crawl worker needs, carried through the call graph instead
/// of living in globals.
pub struct CrawlerCtx {
    pub store: Store,
    pub queue: JobQueue,
    pub limiter: RateLimiter,
    pub fetcher: Fetcher,
    pub extractor: Arc<dyn Extractor>,
    pub metrics: CrawlerMetrics,
    pub config: Arc<CrawlerConfig>,
}
