//! Domain grammar validation shared by the resolver and every adapter.

use crate::errors::QueryError;
use once_cell::sync::Lazy;
use publicsuffix::{List, Psl};
use regex::Regex;
use tracing::warn;

// Global PSL instance - shared across all service instances
static PSL: Lazy<List> = Lazy::new(List::new);

// One label: ASCII alphanumerics and hyphens, no leading/trailing hyphen, 1-63 chars
static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$")
        .expect("domain grammar regex")
});

/// Lower-case, trim whitespace, and strip a trailing DNS root dot.
pub fn sanitize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Validate a domain against the grammar, returning its sanitized form.
pub fn validate(domain: &str) -> Result<String, QueryError> {
    let domain = sanitize(domain);

    if domain.is_empty() {
        return Err(QueryError::InvalidDomain("Empty domain".to_string()));
    }

    if domain.len() > 253 {
        return Err(QueryError::InvalidDomain("Domain name too long".to_string()));
    }

    if !domain.contains('.') {
        return Err(QueryError::InvalidDomain("Invalid domain format".to_string()));
    }

    if domain.contains("..") || domain.starts_with('.') {
        return Err(QueryError::InvalidDomain("Invalid domain format".to_string()));
    }

    if !DOMAIN_RE.is_match(&domain) {
        return Err(QueryError::InvalidDomain(format!("Invalid domain format: {}", domain)));
    }

    Ok(domain)
}

/// Extract the effective TLD using the public suffix list, with a plain
/// last-label fallback when PSL parsing fails.
pub fn extract_tld(domain: &str) -> Result<String, QueryError> {
    match PSL.domain(domain.as_bytes()) {
        Some(parsed_domain) => {
            let suffix = parsed_domain.suffix();
            match std::str::from_utf8(suffix.as_bytes()) {
                Ok(tld) => Ok(tld.to_string()),
                Err(_) => Err(QueryError::InvalidDomain(format!(
                    "Invalid UTF-8 in TLD for domain: {}",
                    domain
                ))),
            }
        }
        None => {
            warn!("Public suffix parsing failed for {}, using fallback", domain);
            match domain.rsplit('.').next() {
                Some(tld) if !tld.is_empty() => Ok(tld.to_string()),
                _ => Err(QueryError::InvalidDomain(format!("No TLD found in domain: {}", domain))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_ordinary_domains() {
        assert_eq!(validate("Example.COM").unwrap(), "example.com");
        assert_eq!(validate("sub.example.co.uk.").unwrap(), "sub.example.co.uk");
        assert_eq!(validate("  xn--bcher-kva.ch  ").unwrap(), "xn--bcher-kva.ch");
    }

    #[test]
    fn test_rejects_malformed_domains() {
        assert!(validate("").is_err());
        assert!(validate("nodot").is_err());
        assert!(validate(".example.com").is_err());
        assert!(validate("exa mple.com").is_err());
        assert!(validate("exa_mple.com").is_err());
        assert!(validate("-example.com").is_err());
        assert!(validate(&format!("{}.com", "a".repeat(260))).is_err());
    }

    #[test]
    fn test_sanitize_strips_root_dot() {
        assert_eq!(sanitize("Example.COM."), "example.com");
    }
}
