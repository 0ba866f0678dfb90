//! Domain and email canonicalization. Every domain that reaches storage or
//! DNS goes through `normalize_domain` so the ASCII-punycode invariant on
//! `official_domain` holds workspace-wide.

use url::Url;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum NormalizeError {
    #[error("empty domain")]
    Empty,
    #[error("not a valid domain: {0}")]
    InvalidDomain(String),
    #[error("not a valid email address: {0}")]
    InvalidEmail(String),
}

/// Canonical ASCII form of a domain. Accepts bare domains, host:port, and
/// full URLs; strips scheme, path, port and a leading `www.`.
pub fn normalize_domain(input: &str) -> Result<String, NormalizeError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(NormalizeError::Empty);
    }
    let host = if trimmed.contains("://") {
        Url::parse(trimmed)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .ok_or_else(|| NormalizeError::InvalidDomain(trimmed.to_string()))?
    } else {
        trimmed
            .split(['/', '?', '#'])
            .next()
            .unwrap_or(trimmed)
            .split(':')
            .next()
            .unwrap_or(trimmed)
            .to_string()
    };
    let host = host.trim_matches('.').to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host.is_empty() {
        return Err(NormalizeError::Empty);
    }
    let ascii = idna::domain_to_ascii(host)
        .map_err(|_| NormalizeError::InvalidDomain(host.to_string()))?;
    if ascii.is_empty() || !ascii.contains('.') {
        return Err(NormalizeError::InvalidDomain(ascii));
    }
    Ok(ascii)
}

/// Lowercased email with a punycoded domain part. Rejects shapes that could
/// never be probed (missing local part or domain).
pub fn normalize_email(input: &str) -> Result<String, NormalizeError> {
    let trimmed = input.trim().trim_matches(|c| c == '<' || c == '>');
    let (local, domain) = trimmed
        .rsplit_once('@')
        .ok_or_else(|| NormalizeError::InvalidEmail(trimmed.to_string()))?;
    let local = local.trim().to_lowercase();
    if local.is_empty() || local.contains(char::is_whitespace) {
        return Err(NormalizeError::InvalidEmail(trimmed.to_string()));
    }
    let domain = normalize_domain(domain)
        .map_err(|_| NormalizeError::InvalidEmail(trimmed.to_string()))?;
    Ok(format!("{local}@{domain}"))
}

/// The domain part of an already-normalized email.
pub fn email_domain(email: &str) -> Option<&str> {
    email.rsplit_once('@').map(|(_, d)| d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scheme_path_and_www() {
        assert_eq!(normalize_domain("https://www.Example.com/team").unwrap(), "example.com");
        assert_eq!(normalize_domain("Example.COM").unwrap(), "example.com");
        assert_eq!(normalize_domain("example.com:8080").unwrap(), "example.com");
        assert_eq!(normalize_domain("example.com/about?x=1").unwrap(), "example.com");
    }

    #[test]
    fn punycodes_unicode_hosts() {
        assert_eq!(normalize_domain("bücher.example").unwrap(), "xn--bcher-kva.example");
    }

    #[test]
    fn rejects_junk() {
        assert_eq!(normalize_domain("   "), Err(NormalizeError::Empty));
        assert!(normalize_domain("not a domain").is_err());
        assert!(normalize_domain("localhost").is_err());
    }

    #[test]
    fn emails_lowercase_and_punycode() {
        assert_eq!(
            normalize_email(" Jane.Doe@Example.COM ").unwrap(),
            "jane.doe@example.com"
        );
        assert_eq!(
            normalize_email("<info@bücher.example>").unwrap(),
            "info@xn--bcher-kva.example"
        );
    }

    #[test]
    fn rejects_malformed_emails() {
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("a b@example.com").is_err());
        assert!(normalize_email("x@").is_err());
    }
}
