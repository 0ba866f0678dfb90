use std::sync::Arc;

use common_observability::VerifierMetrics;
use common_queue::JobQueue;
use common_ratelimit::RateLimiter;
use common_store::Store;

pub mod behavior;
pub mod catchall;
pub mod classify;
pub mod config;
pub mod fallback;
pub mod generate;
pub mod mx;
pub mod permute;
pub mod smtp;
pub mod verify;
pub mod worker;

use config::VerifierConfig;
use fallback::FallbackClient;
use mx::MxResolver;
use smtp::SmtpProber;

/// Everything a verify worker needs, carried through the call graph
/// instead of living in globals.
pub struct VerifierCtx {
    pub store: Store,
    pub queue: JobQueue,
    pub limiter: RateLimiter,
    pub resolver: MxResolver,
    pub prober: SmtpProber,
    pub fallback: Option<FallbackClient>,
    pub metrics: VerifierMetrics,
    pub config: Arc<VerifierConfig>,
}
