use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
#[error("unrecognized {kind} token: {value}")]
pub struct ParseTokenError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! token_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $token:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $token)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $token),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseTokenError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($token => Ok(Self::$variant),)+
                    other => Err(ParseTokenError { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

token_enum!(RunStatus, "run status", {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

token_enum!(RunMode, "run mode", {
    Full => "full",
    Autodiscovery => "autodiscovery",
    Generate => "generate",
    Verify => "verify",
});

impl RunMode {
    pub fn includes_crawl(&self) -> bool {
        matches!(self, Self::Full | Self::Autodiscovery)
    }
    pub fn includes_generate(&self) -> bool {
        matches!(self, Self::Full | Self::Generate)
    }
    pub fn includes_verify(&self) -> bool {
        matches!(self, Self::Full | Self::Verify)
    }
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Full
    }
}

token_enum!(VerifyStatus, "verify status", {
    Valid => "valid",
    RiskyCatchAll => "risky_catch_all",
    Invalid => "invalid",
    UnknownTimeout => "unknown_timeout",
});

token_enum!(CatchAllStatus, "catch-all status", {
    CatchAll => "catch_all",
    NotCatchAll => "not_catch_all",
    TempFail => "tempfail",
    NoMx => "no_mx",
    Error => "error",
});

token_enum!(FallbackStatus, "fallback status", {
    Deliverable => "deliverable",
    Undeliverable => "undeliverable",
    Unknown => "unknown",
});

/// Recognized run option keys. Unknown keys in stored JSON are dropped on
/// deserialization rather than carried around untyped.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RunOptions {
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub skip_crawl: bool,
    #[serde(default)]
    pub skip_verify: bool,
    #[serde(default)]
    pub ai_enabled: bool,
    #[serde(default)]
    pub force_discovery: bool,
    #[serde(default)]
    pub company_limit: Option<i64>,
}

impl RunOptions {
    /// Effective stage plan after applying the mode matrix and skips.
    pub fn wants_crawl(&self) -> bool {
        self.mode.includes_crawl() && !self.skip_crawl
    }
    pub fn wants_generate(&self) -> bool {
        self.mode.includes_generate()
    }
    pub fn wants_verify(&self) -> bool {
        self.mode.includes_verify() && !self.skip_verify
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunProgress {
    pub domains_total: i32,
    pub domains_completed: i32,
    pub emails_found: i32,
    pub emails_verified: i32,
    pub valid_count: i32,
    pub risky_count: i32,
    pub invalid_count: i32,
    pub unknown_count: i32,
}

#[derive(Debug, Clone, FromRow)]
pub struct Run {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub status: String,
    pub domains: Json<Vec<String>>,
    pub options: Json<RunOptions>,
    pub domains_total: i32,
    pub domains_completed: i32,
    pub emails_found: i32,
    pub emails_verified: i32,
    pub valid_count: i32,
    pub risky_count: i32,
    pub invalid_count: i32,
    pub unknown_count: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn status(&self) -> Result<RunStatus, ParseTokenError> {
        self.status.parse()
    }

    pub fn progress(&self) -> RunProgress {
        RunProgress {
            domains_total: self.domains_total,
            domains_completed: self.domains_completed,
            emails_found: self.emails_found,
            emails_verified: self.emails_verified,
            valid_count: self.valid_count,
            risky_count: self.risky_count,
            invalid_count: self.invalid_count,
            unknown_count: self.unknown_count,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Company {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub run_id: Option<Uuid>,
    pub name: String,
    pub supplied_domain: Option<String>,
    pub official_domain: Option<String>,
    pub official_confidence: Option<i32>,
    pub official_source: Option<String>,
    pub attrs: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Person {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub company_id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: String,
    pub title: Option<String>,
    pub title_norm: Option<String>,
    pub role_family: Option<String>,
    pub seniority: Option<String>,
    pub source_url: Option<String>,
    pub icp_score: Option<i32>,
}

#[derive(Debug, Clone, FromRow)]
pub struct EmailRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub company_id: Uuid,
    pub person_id: Option<Uuid>,
    pub email: String,
    pub is_published: bool,
    pub is_generic: bool,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct VerificationResult {
    pub id: i64,
    pub tenant_id: Uuid,
    pub email_id: Uuid,
    pub mx_host: Option<String>,
    pub smtp_code: Option<i32>,
    pub smtp_reason: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub fallback_status: Option<String>,
    pub fallback_at: Option<DateTime<Utc>>,
    pub verify_status: String,
    pub verify_reason: String,
    pub verified_mx: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl VerificationResult {
    pub fn verify_status(&self) -> Result<VerifyStatus, ParseTokenError> {
        self.verify_status.parse()
    }
}

/// Input for `append_verification`. One row per full classification.
#[derive(Debug, Clone, Default)]
pub struct VerificationInput {
    pub mx_host: Option<String>,
    pub smtp_code: Option<i32>,
    pub smtp_reason: Option<String>,
    pub fallback_status: Option<FallbackStatus>,
    pub fallback_at: Option<DateTime<Utc>>,
    pub verify_status: VerifyStatus,
    pub verify_reason: String,
    pub verified_mx: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl Default for VerifyStatus {
    fn default() -> Self {
        Self::UnknownTimeout
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DomainResolution {
    pub id: i64,
    pub tenant_id: Uuid,
    pub company_id: Option<Uuid>,
    pub chosen_domain: String,
    pub method: Option<String>,
    pub confidence: Option<i32>,
    pub mx_hosts: Json<Vec<String>>,
    pub lowest_mx: Option<String>,
    pub no_mx: bool,
    pub catch_all_status: Option<String>,
    pub catch_all_checked_at: Option<DateTime<Utc>>,
    pub catch_all_localpart: Option<String>,
    pub catch_all_smtp_code: Option<i32>,
    pub resolved_at: DateTime<Utc>,
}

impl DomainResolution {
    pub fn catch_all_status(&self) -> Option<CatchAllStatus> {
        self.catch_all_status.as_deref().and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MxBehaviorRow {
    pub mx_host: String,
    pub avg_latency_ms: i32,
    pub last_code: Option<i32>,
    pub last_category: Option<String>,
    pub last_error: Option<String>,
    pub probe_count: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub queues: String,
    pub last_seen_at: DateTime<Utc>,
}
