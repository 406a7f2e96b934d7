//! WhoisXML API provider adapter.
//!
//! The vendor nests a second `registryData` section beside the registrar's
//! own `WhoisRecord` view; the registrar view wins and the registry view
//! backfills whatever it left blank.

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

const DEFAULT_BASE_URL: &str = "https://www.whoisxmlapi.com/whoisserver/WhoisService";

pub struct WhoisXmlProvider {
    http: HttpAdapter,
    base_url: Url,
    api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
struct XmlEnvelope {
    #[serde(rename = "WhoisRecord")]
    whois_record: Option<XmlWhoisRecord>,
    #[serde(rename = "ErrorMessage")]
    error_message: Option<XmlErrorMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct XmlErrorMessage {
    msg: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct XmlWhoisRecord {
    domain_name: Option<String>,
    created_date: Option<String>,
    updated_date: Option<String>,
    expires_date: Option<String>,
    registrar_name: Option<String>,
    /// Space-separated status tokens
    status: Option<String>,
    name_servers: Option<XmlNameServers>,
    registrant: Option<XmlContact>,
    administrative_contact: Option<XmlContact>,
    technical_contact: Option<XmlContact>,
    whois_server: Option<String>,
    registry_data: Option<Box<XmlWhoisRecord>>,
    data_error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct XmlNameServers {
    host_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct XmlContact {
    name: Option<String>,
    organization: Option<String>,
    email: Option<String>,
    telephone: Option<String>,
    country: Option<String>,
    state: Option<String>,
    city: Option<String>,
}

impl From<XmlContact> for Contact {
    fn from(c: XmlContact) -> Self {
        Contact {
            name: c.name,
            organization: c.organization,
            email: c.email,
            phone: c.telephone,
            country: c.country,
            province: c.state,
            city: c.city,
        }
    }
}

impl XmlWhoisRecord {
    /// Collapse the registrar view over the registry view, field by field.
    fn merged(mut self) -> XmlWhoisRecord {
        let Some(registry) = self.registry_data.take() else { return self };
        let registry = *registry;

        XmlWhoisRecord {
            domain_name: self.domain_name.or(registry.domain_name),
            created_date: self.created_date.or(registry.created_date),
            updated_date: self.updated_date.or(registry.updated_date),
            expires_date: self.expires_date.or(registry.expires_date),
            registrar_name: self.registrar_name.or(registry.registrar_name),
            status: self.status.or(registry.status),
            name_servers: match self.name_servers {
                Some(ns) if ns.host_names.as_ref().is_some_and(|h| !h.is_empty()) => Some(ns),
                _ => registry.name_servers,
            },
            registrant: self.registrant.or(registry.registrant),
            administrative_contact: self.administrative_contact.or(registry.administrative_contact),
            technical_contact: self.technical_contact.or(registry.technical_contact),
            whois_server: self.whois_server.or(registry.whois_server),
            registry_data: None,
            data_error: self.data_error.or(registry.data_error),
        }
    }
}

impl WhoisXmlProvider {
    pub fn new(api_key: String) -> Result<Self, QueryError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: String, base_url: &str) -> Result<Self, QueryError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| QueryError::Internal(format!("invalid WhoisXML base URL: {}", e)))?;
        Ok(Self { http: HttpAdapter::new("WhoisXML", false)?, base_url, api_key })
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
            .append_pair("domainName", domain)
            .append_pair("outputFormat", "JSON")
            .append_pair("da", "1");
        url
    }

    fn to_record(&self, domain: &str, merged: XmlWhoisRecord) -> DomainRecord {
        if merged.data_error.as_deref().is_some_and(|e| e.contains("MISSING_WHOIS_DATA")) {
            let mut record =
                DomainRecord::failure(domain, STATUS_NOT_FOUND, "domain not registered", self.name());
            record.available = true;
            return record;
        }

        let mut record = DomainRecord::empty(domain);
        record.source_provider = self.name().to_string();

        if let Some(name) = merged.domain_name.filter(|n| !n.is_empty()) {
            record.domain = name;
        }
        record.registrar = merged.registrar_name;
        record.creation_date = merged.created_date.as_deref().and_then(parser::normalize_date);
        record.updated_date = merged.updated_date.as_deref().and_then(parser::normalize_date);
        record.expiry_date = merged.expires_date.as_deref().and_then(parser::normalize_date);
        record.name_servers =
            merged.name_servers.and_then(|ns| ns.host_names).unwrap_or_default();
        record.domain_status = merged
            .status
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        record.whois_server = merged.whois_server;

        let contacts = ContactSet {
            registrant: merged.registrant.map(Contact::from).filter(|c| !c.is_empty()),
            admin: merged.administrative_contact.map(Contact::from).filter(|c| !c.is_empty()),
            tech: merged.technical_contact.map(Contact::from).filter(|c| !c.is_empty()),
        };
        if !contacts.is_empty() {
            record.contacts = Some(contacts);
        }

        record.normalize();
        record
    }
}

#[async_trait]
impl Provider for WhoisXmlProvider {
    fn name(&self) -> &'static str {
        "WhoisXML"
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
                if value.get("WhoisRecord").is_none() && value.get("ErrorMessage").is_none() {
                    Err("payload carries neither WhoisRecord nor ErrorMessage".to_string())
                } else {
                    Ok(())
                }
            })
            .await?;

        let envelope: XmlEnvelope = serde_json::from_value(json)?;

        if let Some(error) = envelope.error_message {
            let message = error.msg.unwrap_or_else(|| "unspecified vendor error".to_string());
            return Err(QueryError::UpstreamStatus { status: 500, message });
        }

        let merged = envelope
            .whois_record
            .ok_or_else(|| QueryError::BadPayload("missing WhoisRecord".to_string()))?
            .merged();

        Ok(self.to_record(&domain, merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn provider_for(server: &MockServer) -> WhoisXmlProvider {
        WhoisXmlProvider::with_base_url("test-key".to_string(), &format!("{}/whoisserver/WhoisService", server.uri()))
            .unwrap()
            .with_fast_retries()
    }

    #[tokio::test]
    async fn test_registrar_view_wins_with_registry_backfill() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/whoisserver/WhoisService"))
            .and(query_param("domainName", "example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "WhoisRecord": {
                    "domainName": "example.com",
                    "registrarName": "Registrar View LLC",
                    "registryData": {
                        "domainName": "example.com",
                        "registrarName": "Registry View Inc",
                        "createdDate": "1995-08-14T04:00:00Z",
                        "expiresDate": "2030-08-13T04:00:00Z",
                        "status": "clientDeleteProhibited clientTransferProhibited",
                        "nameServers": {"hostNames": ["a.iana-servers.net", "b.iana-servers.net"]}
                    }
                }
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server).await;
        let record = provider.query("example.com", Duration::from_secs(2)).await.unwrap();

        // Registrar section present -> wins; missing fields backfilled
        assert_eq!(record.registrar.as_deref(), Some("Registrar View LLC"));
        assert_eq!(record.creation_date.as_deref(), Some("1995-08-14"));
        assert_eq!(record.expiry_date.as_deref(), Some("2030-08-13"));
        assert_eq!(record.domain_status.len(), 2);
        assert_eq!(record.name_servers.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_whois_data_means_available() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/whoisserver/WhoisService"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "WhoisRecord": {
                    "domainName": "unregistered-domain.com",
                    "dataError": "MISSING_WHOIS_DATA"
                }
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server).await;
        let record = provider.query("unregistered-domain.com", Duration::from_secs(2)).await.unwrap();
        assert!(record.available);
        assert!(!record.is_well_formed());
    }

    #[tokio::test]
    async fn test_vendor_error_message_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/whoisserver/WhoisService"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ErrorMessage": {"errorCode": "API_KEY_04", "msg": "API key is invalid"}
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server).await;
        let error = provider.query("example.com", Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(error, QueryError::UpstreamStatus { status: 500, .. }));
    }
}
