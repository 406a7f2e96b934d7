//! WhoisFreaks HTTP-JSON provider adapter.
//!
//! Live WHOIS lookups through the vendor's v1.0 API. The API key travels in
//! the query string and is masked in every log line.

use crate::{
    errors::QueryError,
    parser,
    provider::{HttpAdapter, Provider, ProviderKind},
    validate, Contact, ContactSet, DomainRecord, STATUS_NOT_FOUND,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.whoisfreaks.com/v1.0/whois";

pub struct WhoisFreaksProvider {
    http: HttpAdapter,
    base_url: Url,
    api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
struct FreaksResponse {
    domain_name: Option<String>,
    domain_registered: Option<String>,
    create_date: Option<String>,
    update_date: Option<String>,
    expiry_date: Option<String>,
    domain_registrar: Option<FreaksRegistrar>,
    name_servers: Option<Vec<String>>,
    domain_status: Option<Vec<String>>,
    whois_server: Option<String>,
    registrant_contact: Option<FreaksContact>,
    administrative_contact: Option<FreaksContact>,
    technical_contact: Option<FreaksContact>,
}

#[derive(Debug, Clone, Deserialize)]
struct FreaksRegistrar {
    registrar_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FreaksContact {
    name: Option<String>,
    company_name: Option<String>,
    email_address: Option<String>,
    phone: Option<String>,
    country_name: Option<String>,
    state: Option<String>,
    city: Option<String>,
}

impl From<FreaksContact> for Contact {
    fn from(c: FreaksContact) -> Self {
        Contact {
            name: c.name,
            organization: c.company_name,
            email: c.email_address,
            phone: c.phone,
            country: c.country_name,
            province: c.state,
            city: c.city,
        }
    }
}

impl WhoisFreaksProvider {
    pub fn new(api_key: String) -> Result<Self, QueryError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: String, base_url: &str) -> Result<Self, QueryError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| QueryError::Internal(format!("invalid WhoisFreaks base URL: {}", e)))?;
        Ok(Self { http: HttpAdapter::new("WhoisFreaks", false)?, base_url, api_key })
    }

    /// Bound each HTTP attempt, independent of the caller's budget.
    pub fn with_attempt_cap(mut self, cap: Duration) -> Self {
        self.http = self.http.with_attempt_cap(cap);
        self
    }

    #[cfg(test)]
    fn with_fast_retries(mut self) -> Self {
        self.http = self.http.with_retry_base(Duration::from_millis(10));
        self
    }

    fn query_url(&self, domain: &str) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("apiKey", &self.api_key)
            .append_pair("whois", "live")
            .append_pair("domainName", domain);
        url
    }

    fn to_record(&self, domain: &str, response: FreaksResponse) -> DomainRecord {
        if response.domain_registered.as_deref() == Some("no") {
            let mut record =
                DomainRecord::failure(domain, STATUS_NOT_FOUND, "domain not registered", self.name());
            record.available = true;
            return record;
        }

        let mut record = DomainRecord::empty(domain);
        record.source_provider = self.name().to_string();

        if let Some(name) = response.domain_name.filter(|n| !n.is_empty()) {
            record.domain = name;
        }
        record.registrar = response.domain_registrar.and_then(|r| r.registrar_name);
        record.creation_date = response.create_date.as_deref().and_then(parser::normalize_date);
        record.updated_date = response.update_date.as_deref().and_then(parser::normalize_date);
        record.expiry_date = response.expiry_date.as_deref().and_then(parser::normalize_date);
        record.name_servers = response.name_servers.unwrap_or_default();
        record.domain_status = response.domain_status.unwrap_or_default();
        record.whois_server = response.whois_server;

        let contacts = ContactSet {
            registrant: response.registrant_contact.map(Contact::from).filter(|c| !c.is_empty()),
            admin: response.administrative_contact.map(Contact::from).filter(|c| !c.is_empty()),
            tech: response.technical_contact.map(Contact::from).filter(|c| !c.is_empty()),
        };
        if !contacts.is_empty() {
            record.contacts = Some(contacts);
        }

        record.normalize();
        record
    }
}

#[async_trait]
impl Provider for WhoisFreaksProvider {
    fn name(&self) -> &'static str {
        "WhoisFreaks"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::HttpJson
    }

    async fn query(
        &self,
        domain: &str,
        attempt_timeout: Duration,
    ) -> Result<DomainRecord, QueryError> {
        let domain = validate::validate(domain)?;
        let url = self.query_url(&domain);

        let json = self
            .http
            .get_json_checked(&url, "application/json", attempt_timeout, |value| {
                let registered = value["domain_registered"].as_str();
                let name = value["domain_name"].as_str().unwrap_or("");
                if name.is_empty() && registered != Some("no") {
                    Err("empty domain field in payload".to_string())
                } else {
                    Ok(())
                }
            })
            .await?;

        let response: FreaksResponse = serde_json::from_value(json)?;
        Ok(self.to_record(&domain, response))
    }
}
