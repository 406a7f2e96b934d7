//! # Domain Intel Library
//!
//! A resilient, multi-provider domain-information query library for Rust.
//!
//! ## Features
//!
//! - Parallel fan-out across heterogeneous WHOIS/RDAP providers
//! - First-well-formed-answer-wins resolution with provider failover
//! - Per-provider usage scoring with automatic cooldown re-enablement
//! - Redis-backed result cache with expiry-adaptive TTLs
//! - Sliding-window distributed rate limiting
//! - Circuit breakers for auxiliary upstream scopes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use domain_intel::{Config, DomainIntelClient};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(Config::load()?);
//!     let client = DomainIntelClient::new(config).await?;
//!     let resolution = client.lookup("google.com").await;
//!
//!     println!("Domain: {}", resolution.record.domain);
//!     println!("Registrar: {:?}", resolution.record.registrar);
//!
//!     Ok(())
//! }
//! ```

pub mod breaker;
pub mod cache;
pub mod config;
pub mod errors;
pub mod health;
pub mod iana_whois;
pub mod limiter;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod provider;
pub mod rdap;
pub mod registry;
pub mod resolver;
pub mod validate;
pub mod whoisfreaks;
pub mod whoisxml;

// Re-export main types for easy access
pub use breaker::CircuitBreaker;
pub use cache::ResultCache;
pub use config::Config;
pub use errors::QueryError;
pub use limiter::SlidingWindowLimiter;
pub use provider::Provider;
pub use registry::ProviderRegistry;
pub use resolver::{Resolution, Resolver};

use std::sync::Arc;

/// Status code carried by a record returned from a fresh provider query.
pub const STATUS_OK: u16 = 200;
/// Status code carried by a record served from the result cache.
pub const STATUS_OK_CACHE: u16 = 201;
/// Malformed request (e.g. empty domain parameter).
pub const STATUS_BAD_REQUEST: u16 = 400;
/// Domain not found at the upstream registry.
pub const STATUS_NOT_FOUND: u16 = 404;
/// The overall resolve deadline elapsed before any provider answered.
pub const STATUS_TIMEOUT: u16 = 408;
/// Domain failed the grammar check.
pub const STATUS_INVALID_DOMAIN: u16 = 422;
/// Upstream (or local) rate limiting.
pub const STATUS_RATE_LIMITED: u16 = 429;
/// Upstream server error.
pub const STATUS_SERVER_ERROR: u16 = 500;
/// Every enabled provider failed to produce a well-formed record.
pub const STATUS_ALL_FAILED: u16 = 503;

/// A single registration contact (registrant, admin, or tech).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Contact {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

impl Contact {
    /// True when no field is populated.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.organization.is_none()
            && self.email.is_none()
            && self.phone.is_none()
            && self.country.is_none()
            && self.province.is_none()
            && self.city.is_none()
    }
}

/// The three contact slots a registry may disclose.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ContactSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registrant: Option<Contact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin: Option<Contact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tech: Option<Contact>,
}

impl ContactSet {
    /// True when none of the three slots carries data.
    pub fn is_empty(&self) -> bool {
        self.registrant.as_ref().map_or(true, Contact::is_empty)
            && self.admin.as_ref().map_or(true, Contact::is_empty)
            && self.tech.as_ref().map_or(true, Contact::is_empty)
    }
}

/// Unified domain record produced by every provider adapter.
///
/// Failure outcomes are records too: the status code carries the failure
/// class and the registration fields stay empty.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DomainRecord {
    pub domain: String,
    pub available: bool,
    pub source_provider: String,
    pub status_code: u16,
    pub status_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registrar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_days: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub name_servers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whois_server: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub domain_status: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contacts: Option<ContactSet>,
    /// Set only when the record was served from the result cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<String>,
}

impl DomainRecord {
    /// Empty record skeleton for a domain, prior to normalization.
    pub fn empty(domain: &str) -> Self {
        Self {
            domain: domain.to_ascii_lowercase(),
            available: true,
            source_provider: String::new(),
            status_code: STATUS_OK,
            status_message: "success".to_string(),
            registrar: None,
            creation_date: None,
            updated_date: None,
            expiry_date: None,
            age_days: None,
            name_servers: Vec::new(),
            whois_server: None,
            domain_status: Vec::new(),
            contacts: None,
            cached_at: None,
        }
    }

    /// Taxonomized failure record carrying no registration data.
    pub fn failure(domain: &str, status_code: u16, message: impl Into<String>, source: &str) -> Self {
        let mut record = Self::empty(domain);
        record.available = false;
        record.status_code = status_code;
        record.status_message = message.into();
        record.source_provider = source.to_string();
        record
    }

    /// A record is well-formed (and cache-worthy) when at least one of
    /// registrar, expiry date, or status tokens is populated.
    pub fn is_well_formed(&self) -> bool {
        self.registrar.is_some() || self.expiry_date.is_some() || !self.domain_status.is_empty()
    }

    /// Enforce the cross-field invariants after a provider populated the
    /// registration fields: a registered domain is never available,
    /// nameservers are lower-case without a trailing dot, and the age is
    /// derived from the creation date.
    pub fn normalize(&mut self) {
        self.domain = self.domain.trim().trim_end_matches('.').to_ascii_lowercase();

        let mut seen = std::collections::HashSet::new();
        self.name_servers = self
            .name_servers
            .iter()
            .map(|ns| ns.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|ns| !ns.is_empty() && seen.insert(ns.clone()))
            .collect();

        if self.registrar.is_some()
            || self.creation_date.is_some()
            || self.updated_date.is_some()
            || self.expiry_date.is_some()
            || !self.name_servers.is_empty()
        {
            self.available = false;
        }

        self.age_days = self
            .creation_date
            .as_deref()
            .and_then(parser::parse_datetime)
            .map(|created| (chrono::Utc::now() - created).num_days());

        if let Some(contacts) = &self.contacts {
            if contacts.is_empty() {
                self.contacts = None;
            }
        }
    }
}

/// Outcome of one provider query inside a resolve fan-out.
#[derive(Debug)]
pub struct ProviderOutcome {
    pub provider: String,
    pub result: Result<DomainRecord, QueryError>,
}

/// High-level client bundling the registry, resolver, and optional cache.
#[derive(Clone)]
pub struct DomainIntelClient {
    resolver: Arc<Resolver>,
}

impl DomainIntelClient {
    /// Build a client from configuration: constructs all configured provider
    /// adapters, seeds the registry, and connects the Redis-backed cache.
    ///
    /// When Redis is unreachable the cache is skipped with a warning and the
    /// resolver degrades to always-fresh lookups.
    pub async fn new(config: Arc<Config>) -> Result<Self, QueryError> {
        let registry = Arc::new(ProviderRegistry::from_config(&config)?);

        let cache = match ResultCache::connect(&config.redis_url).await {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                tracing::warn!("Result cache unavailable, continuing without it: {}", e);
                None
            }
        };

        let resolver = Arc::new(Resolver::new(registry, cache, config));
        Ok(Self { resolver })
    }

    /// Build a client that never touches Redis.
    pub fn new_without_cache(config: Arc<Config>) -> Result<Self, QueryError> {
        let registry = Arc::new(ProviderRegistry::from_config(&config)?);
        let resolver = Arc::new(Resolver::new(registry, None, config));
        Ok(Self { resolver })
    }

    /// Resolve a domain through the cache and the provider fan-out.
    pub async fn lookup(&self, domain: &str) -> Resolution {
        self.resolver.resolve(domain).await
    }

    /// Shared resolver handle, for wiring the health probe and HTTP surface.
    pub fn resolver(&self) -> Arc<Resolver> {
        self.resolver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_formed_requires_registration_evidence() {
        let record = DomainRecord::empty("example.com");
        assert!(!record.is_well_formed());

        let mut with_registrar = DomainRecord::empty("example.com");
        with_registrar.registrar = Some("IANA".to_string());
        assert!(with_registrar.is_well_formed());

        let mut with_status = DomainRecord::empty("example.com");
        with_status.domain_status = vec!["clientTransferProhibited".to_string()];
        assert!(with_status.is_well_formed());
    }

    #[test]
    fn test_normalize_lowercases_and_dedupes_nameservers() {
        let mut record = DomainRecord::empty("Example.COM.");
        record.name_servers = vec![
            "NS1.Example.COM.".to_string(),
            "ns1.example.com".to_string(),
            "ns2.example.com".to_string(),
        ];
        record.normalize();

        assert_eq!(record.domain, "example.com");
        assert_eq!(record.name_servers, vec!["ns1.example.com", "ns2.example.com"]);
        // Delegation data implies registration
        assert!(!record.available);
    }

    #[test]
    fn test_failure_record_carries_no_registration_data() {
        let record =
            DomainRecord::failure("example.com", STATUS_ALL_FAILED, "all providers failed", "All");
        assert_eq!(record.status_code, STATUS_ALL_FAILED);
        assert!(record.registrar.is_none());
        assert!(record.contacts.is_none());
        assert!(!record.is_well_formed());
    }
}
