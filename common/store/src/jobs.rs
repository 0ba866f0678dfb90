//! Stage job payloads shared by the services. Payloads are versioned by
//! shape only: additive fields must carry `#[serde(default)]` so in-flight
//! jobs survive a rolling deploy.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const QUEUE_CRAWL: &str = "crawl";
pub const QUEUE_GENERATE: &str = "generate";
pub const QUEUE_VERIFY: &str = "verify";

/// Crawl + extract stage for one domain of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutodiscoveryJob {
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub company_id: Uuid,
    pub domain: String,
    #[serde(default)]
    pub ai_enabled: bool,
    #[serde(default)]
    pub force_discovery: bool,
}

/// Pattern detection + permutation stage for one domain of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateEmailsJob {
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub company_id: Uuid,
    pub domain: String,
}

/// Fan-out stage: enumerates unverified emails for the domain and enqueues
/// one `ProbeEmailJob` each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyDomainJob {
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub company_id: Uuid,
    pub domain: String,
}

/// One email's verification workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeEmailJob {
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub company_id: Uuid,
    pub email_id: Uuid,
    pub email: String,
    pub domain: String,
}

/// The `verify` queue carries both the per-domain fan-out task and the
/// per-email probes it spawns; the `task` tag tells them apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum VerifyTask {
    VerifyDomain(VerifyDomainJob),
    ProbeEmail(ProbeEmailJob),
}
