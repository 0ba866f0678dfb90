//! MX resolution with a freemail denylist, a persisted 24-hour cache, and
//! implicit-MX fallback to A/AAAA records.

use common_store::normalize::normalize_domain;
use common_store::{ResolutionInput, Store};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const BUILTIN_FREEMAIL: &[&str] = &[
    "gmail.com", "googlemail.com", "yahoo.com", "yahoo.co.uk", "ymail.com",
    "outlook.com", "hotmail.com", "hotmail.co.uk", "live.com", "msn.com",
    "aol.com", "icloud.com", "me.com", "mac.com", "protonmail.com", "proton.me",
    "gmx.com", "gmx.de", "web.de", "mail.com", "mail.ru", "yandex.com",
    "yandex.ru", "zoho.com", "fastmail.com", "hey.com",
];

#[derive(Debug, Clone)]
pub struct MxOutcome {
    pub domain: String,
    pub mx_hosts: Vec<String>,
    pub lowest_mx: Option<String>,
    pub no_mx: bool,
    pub freemail: bool,
    pub cached: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum MxError {
    #[error("invalid domain: {0}")]
    InvalidDomain(String),
    #[error("dns failure: {0}")]
    Dns(String),
    #[error("store failure: {0}")]
    Store(#[from] common_store::StoreError),
}

impl MxError {
    /// DNS and store hiccups are transient; a bad domain is not.
    pub fn retryable(&self) -> bool {
        !matches!(self, MxError::InvalidDomain(_))
    }
}

pub struct MxResolver {
    resolver: TokioAsyncResolver,
    freemail: HashSet<String>,
    cache_ttl: Duration,
}

impl MxResolver {
    pub fn new(dns_timeout: Duration, cache_ttl: Duration, freemail_extra: &HashSet<String>) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = dns_timeout;
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);
        let mut freemail: HashSet<String> =
            BUILTIN_FREEMAIL.iter().map(|d| d.to_string()).collect();
        freemail.extend(freemail_extra.iter().cloned());
        Self { resolver, freemail, cache_ttl }
    }

    pub fn is_freemail(&self, domain: &str) -> bool {
        self.freemail.contains(domain)
    }

    /// Resolve MX hosts for a domain, consulting the persisted resolution
    /// cache first. A fresh resolution is appended as a new
    /// DomainResolution audit row.
    pub async fn resolve(
        &self,
        store: &Store,
        tenant_id: Uuid,
        company_id: Option<Uuid>,
        raw_domain: &str,
        force: bool,
    ) -> Result<MxOutcome, MxError> {
        let domain = normalize_domain(raw_domain)
            .map_err(|e| MxError::InvalidDomain(format!("{raw_domain}: {e}")))?;

        // Freemail domains never get network traffic from us.
        if self.is_freemail(&domain) {
            return Ok(MxOutcome {
                domain,
                mx_hosts: Vec::new(),
                lowest_mx: None,
                no_mx: true,
                freemail: true,
                cached: false,
            });
        }

        if !force {
            if let Some(row) = store.latest_resolution(tenant_id, &domain).await? {
                let fresh = (chrono::Utc::now() - row.resolved_at)
                    .to_std()
                    .map(|age| age < self.cache_ttl)
                    .unwrap_or(false);
                if fresh && row.method.as_deref() == Some("mx") {
                    return Ok(MxOutcome {
                        domain,
                        mx_hosts: row.mx_hosts.0.clone(),
                        lowest_mx: row.lowest_mx.clone(),
                        no_mx: row.no_mx,
                        freemail: false,
                        cached: true,
                    });
                }
            }
        }

        let (mx_hosts, no_mx) = self.query(&domain).await?;
        let lowest_mx = mx_hosts.first().cloned();
        store
            .insert_resolution(
                tenant_id,
                company_id,
                &ResolutionInput {
                    chosen_domain: domain.clone(),
                    method: Some("mx".to_string()),
                    confidence: None,
                    mx_hosts: mx_hosts.clone(),
                    lowest_mx: lowest_mx.clone(),
                    no_mx,
                },
            )
            .await?;

        Ok(MxOutcome { domain, mx_hosts, lowest_mx, no_mx, freemail: false, cached: false })
    }

    /// Raw DNS: MX records ordered by preference, falling back to an
    /// implicit MX (the domain itself) when an address record exists.
    async fn query(&self, domain: &str) -> Result<(Vec<String>, bool), MxError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let mut records: Vec<(u16, String)> = lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_ascii();
                        (mx.preference(), host.trim_end_matches('.').to_lowercase())
                    })
                    .filter(|(_, host)| !host.is_empty())
                    .collect();
                if records.is_empty() {
                    return self.implicit_mx(domain).await;
                }
                records.sort();
                records.dedup_by(|a, b| a.1 == b.1);
                Ok((records.into_iter().map(|(_, host)| host).collect(), false))
            }
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => self.implicit_mx(domain).await,
                _ => Err(MxError::Dns(e.to_string())),
            },
        }
    }

    async fn implicit_mx(&self, domain: &str) -> Result<(Vec<String>, bool), MxError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => {
                if lookup.iter().next().is_some() {
                    debug!(%domain, "no MX records, using implicit MX");
                    Ok((vec![domain.to_string()], false))
                } else {
                    Ok((Vec::new(), true))
                }
            }
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok((Vec::new(), true)),
                _ => Err(MxError::Dns(e.to_string())),
            },
        }
    }
}
