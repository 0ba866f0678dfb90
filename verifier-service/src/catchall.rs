//! Catch-all detection: probe a local part that cannot exist and see
//! whether the domain accepts it. Verdicts are cached on the latest
//! DomainResolution row with a TTL.

use chrono::Utc;
use common_store::{CatchAllStatus, Store};
use rand::Rng;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::mx::MxOutcome;
use crate::smtp::{ProbeCategory, SmtpProber};

#[derive(Debug, Clone)]
pub struct CatchAllVerdict {
    pub status: CatchAllStatus,
    pub localpart: Option<String>,
    pub smtp_code: Option<u16>,
    pub cached: bool,
}

/// A local part that cannot collide with a real mailbox: 16 hex chars plus
/// a timestamp suffix.
pub fn random_localpart() -> String {
    let nonce: u64 = rand::thread_rng().gen();
    format!("{nonce:016x}{}", Utc::now().timestamp())
}

pub async fn catchall_status(
    store: &Store,
    prober: &SmtpProber,
    tenant_id: Uuid,
    mx: &MxOutcome,
    ttl: Duration,
    force: bool,
) -> Result<CatchAllVerdict, common_store::StoreError> {
    if mx.no_mx {
        return Ok(CatchAllVerdict {
            status: CatchAllStatus::NoMx,
            localpart: None,
            smtp_code: None,
            cached: false,
        });
    }

    if !force {
        if let Some(row) = store.latest_resolution(tenant_id, &mx.domain).await? {
            if let (Some(status), Some(checked_at)) =
                (row.catch_all_status(), row.catch_all_checked_at)
            {
                let fresh = (Utc::now() - checked_at)
                    .to_std()
                    .map(|age| age < ttl)
                    .unwrap_or(false);
                // Cached tempfail/error verdicts are not authoritative;
                // re-probe those.
                if fresh && matches!(status, CatchAllStatus::CatchAll | CatchAllStatus::NotCatchAll)
                {
                    return Ok(CatchAllVerdict {
                        status,
                        localpart: row.catch_all_localpart.clone(),
                        smtp_code: row.catch_all_smtp_code.map(|c| c as u16),
                        cached: true,
                    });
                }
            }
        }
    }

    let Some(lowest_mx) = mx.lowest_mx.as_deref() else {
        return Ok(CatchAllVerdict {
            status: CatchAllStatus::NoMx,
            localpart: None,
            smtp_code: None,
            cached: false,
        });
    };

    let localpart = random_localpart();
    let probe_address = format!("{localpart}@{}", mx.domain);
    let outcome = prober.probe(&probe_address, lowest_mx).await;
    let status = match outcome.category {
        ProbeCategory::Accept => CatchAllStatus::CatchAll,
        ProbeCategory::HardFail => CatchAllStatus::NotCatchAll,
        ProbeCategory::TempFail => CatchAllStatus::TempFail,
        ProbeCategory::Unknown => {
            // A tarpit or timeout is transient; a refused conversation is not.
            if outcome.error.as_deref() == Some("timeout") {
                CatchAllStatus::TempFail
            } else {
                CatchAllStatus::Error
            }
        }
    };
    debug!(domain = %mx.domain, status = status.as_str(), code = ?outcome.code, "catch-all probe");

    store
        .set_catchall_verdict(
            tenant_id,
            &mx.domain,
            status,
            Some(&localpart),
            outcome.code.map(i32::from),
        )
        .await?;

    Ok(CatchAllVerdict {
        status,
        localpart: Some(localpart),
        smtp_code: outcome.code,
        cached: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_localparts_are_unique_and_hexish() {
        let a = random_localpart();
        let b = random_localpart();
        assert_ne!(a, b);
        assert!(a.len() >= 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
