//! RDAP (Registration Data Access Protocol) provider adapter.
//!
//! Modern successor to WHOIS providing structured JSON responses. Queries go
//! through public bootstrap aggregators which 301/302 to the authoritative
//! registry server; redirects are chased by hand (RFC 7480 bootstrapping).

use crate::{
    errors::QueryError,
    parser,
    provider::{HttpAdapter, Provider, ProviderKind},
    validate, Contact, ContactSet, DomainRecord, STATUS_NOT_FOUND,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

const RDAP_ACCEPT: &str = "application/rdap+json, application/json";

// Aggregators tried in order; each redirects to the registry for the TLD
const DEFAULT_BOOTSTRAP_BASES: [&str; 2] =
    ["https://rdap.org/domain/", "https://bootstrap.rdap.org/domain/"];

// Pause between consecutive bootstrap bases
const BOOTSTRAP_SPACING: Duration = Duration::from_millis(200);

pub struct RdapProvider {
    http: HttpAdapter,
    bootstrap_bases: Vec<Url>,
}

#[derive(Debug, Clone, Deserialize)]
struct RdapDomainResponse {
    #[serde(rename = "ldhName")]
    ldh_name: Option<String>,
    #[serde(rename = "nameservers")]
    name_servers: Option<Vec<RdapNameserver>>,
    events: Option<Vec<RdapEvent>>,
    entities: Option<Vec<RdapEntity>>,
    status: Option<Vec<String>>,
    port43: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RdapNameserver {
    #[serde(rename = "ldhName")]
    ldh_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RdapEvent {
    #[serde(rename = "eventAction")]
    event_action: Option<String>,
    #[serde(rename = "eventDate")]
    event_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RdapEntity {
    handle: Option<String>,
    roles: Option<Vec<String>>,
    #[serde(rename = "vcardArray")]
    vcard_array: Option<serde_json::Value>,
}

impl RdapProvider {
    pub fn new() -> Result<Self, QueryError> {
        Self::with_bootstrap_bases(
            DEFAULT_BOOTSTRAP_BASES.iter().map(|b| b.to_string()).collect(),
        )
    }

    /// Override the bootstrap endpoints; bases must end with a slash so the
    /// domain joins as a path segment.
    pub fn with_bootstrap_bases(bases: Vec<String>) -> Result<Self, QueryError> {
        let bootstrap_bases = bases
            .iter()
            .map(|b| Url::parse(b))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| QueryError::Internal(format!("invalid bootstrap URL: {}", e)))?;

        Ok(Self { http: HttpAdapter::new("RDAP", true)?, bootstrap_bases })
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

    async fn query_base(
        &self,
        base: &Url,
        domain: &str,
        attempt_timeout: Duration,
    ) -> Result<DomainRecord, QueryError> {
        let url = base
            .join(domain)
            .map_err(|e| QueryError::Internal(format!("failed to construct RDAP URL: {}", e)))?;

        let json = self.http.get_json(&url, RDAP_ACCEPT, attempt_timeout).await?;
        let rdap: RdapDomainResponse = serde_json::from_value(json)?;

        let mut record = self.to_record(domain, rdap);
        record.whois_server.get_or_insert_with(|| base.host_str().unwrap_or("rdap").to_string());
        record.normalize();
        // The registry answered, so the name is taken regardless of how
        // sparse the disclosed data is
        record.available = false;
        Ok(record)
    }

    fn to_record(&self, domain: &str, rdap: RdapDomainResponse) -> DomainRecord {
        let mut record = DomainRecord::empty(domain);
        record.source_provider = self.name().to_string();

        if let Some(ldh) = rdap.ldh_name {
            record.domain = ldh.to_ascii_lowercase();
        }

        if let Some(nameservers) = rdap.name_servers {
            record.name_servers =
                nameservers.into_iter().filter_map(|ns| ns.ldh_name).collect();
        }

        if let Some(status) = rdap.status {
            record.domain_status = status;
        }

        record.whois_server = rdap.port43;

        if let Some(events) = rdap.events {
            for event in events {
                let (Some(action), Some(date)) = (&event.event_action, &event.event_date) else {
                    continue;
                };
                match action.to_ascii_lowercase().as_str() {
                    "registration" => {
                        record.creation_date = parser::normalize_date(date);
                    }
                    "expiration" => {
                        record.expiry_date = parser::normalize_date(date);
                    }
                    "last changed" | "last update of rdap database" => {
                        if record.updated_date.is_none() {
                            record.updated_date = parser::normalize_date(date);
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut contacts = ContactSet::default();
        for entity in rdap.entities.unwrap_or_default() {
            let Some(roles) = &entity.roles else { continue };

            if roles.iter().any(|r| r.eq_ignore_ascii_case("registrar")) {
                record.registrar = entity
                    .vcard_array
                    .as_ref()
                    .and_then(extract_vcard_fn)
                    .or_else(|| entity.handle.clone());
            }

            let contact = entity.vcard_array.as_ref().map(extract_vcard_contact);
            if let Some(contact) = contact.filter(|c| !c.is_empty()) {
                if roles.iter().any(|r| r.eq_ignore_ascii_case("registrant")) {
                    contacts.registrant.get_or_insert(contact.clone());
                }
                if roles.iter().any(|r| r.eq_ignore_ascii_case("administrative")) {
                    contacts.admin.get_or_insert(contact.clone());
                }
                if roles.iter().any(|r| r.eq_ignore_ascii_case("technical")) {
                    contacts.tech.get_or_insert(contact);
                }
            }
        }
        if !contacts.is_empty() {
            record.contacts = Some(contacts);
        }

        record
    }
}

#[async_trait]
impl Provider for RdapProvider {
    fn name(&self) -> &'static str {
        "RDAP"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Rdap
    }

    async fn query(
        &self,
        domain: &str,
        attempt_timeout: Duration,
    ) -> Result<DomainRecord, QueryError> {
        let domain = validate::validate(domain)?;
        let mut last_error = QueryError::Internal("no bootstrap base configured".to_string());

        for (i, base) in self.bootstrap_bases.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(BOOTSTRAP_SPACING).await;
            }

            match self.query_base(base, &domain, attempt_timeout).await {
                Ok(record) => return Ok(record),
                // 404 from a bootstrap aggregator is a definitive answer:
                // no registry has the name
                Err(QueryError::NotFound) => {
                    let mut record = DomainRecord::failure(
                        &domain,
                        STATUS_NOT_FOUND,
                        "domain not registered",
                        self.name(),
                    );
                    record.available = true;
                    return Ok(record);
                }
                Err(e) => {
                    debug!(base = %base, "bootstrap base failed: {}", e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}

/// vCard `fn` property: the display name of the entity.
fn extract_vcard_fn(vcard: &serde_json::Value) -> Option<String> {
    vcard_property(vcard, "fn").and_then(|v| v.as_str().map(String::from))
}

/// Pull the contact fields out of a jCard array (RFC 7095): the second
/// element is a list of `[name, params, type, value]` properties.
fn extract_vcard_contact(vcard: &serde_json::Value) -> Contact {
    let mut contact = Contact {
        name: vcard_property(vcard, "fn").and_then(|v| v.as_str().map(String::from)),
        organization: vcard_property(vcard, "org").and_then(|v| v.as_str().map(String::from)),
        email: vcard_property(vcard, "email").and_then(|v| v.as_str().map(String::from)),
        phone: vcard_property(vcard, "tel")
            .and_then(|v| v.as_str().map(|s| s.trim_start_matches("tel:").to_string())),
        ..Contact::default()
    };

    // adr value is a seven-component array; 3/4/6 are city/province/country
    if let Some(adr) = vcard_property(vcard, "adr").and_then(|v| v.as_array().cloned()) {
        let component = |i: usize| {
            adr.get(i).and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(String::from)
        };
        contact.city = component(3);
        contact.province = component(4);
        contact.country = component(6);
    }

    contact
}

fn vcard_property(vcard: &serde_json::Value, property: &str) -> Option<serde_json::Value> {
    let items = vcard.as_array()?.get(1)?.as_array()?;
    for item in items {
        let fields = item.as_array()?;
        if fields.first()?.as_str()? == property {
            return fields.get(3).cloned();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rdap_body() -> serde_json::Value {
        serde_json::json!({
            "objectClassName": "domain",
            "ldhName": "EXAMPLE.COM",
            "events": [
                {"eventAction": "registration", "eventDate": "1995-08-14T04:00:00Z"},
                {"eventAction": "EXPIRATION", "eventDate": "2030-08-13T04:00:00Z"},
                {"eventAction": "last changed", "eventDate": "2024-08-14T07:01:31Z"}
            ],
            "nameservers": [
                {"ldhName": "A.IANA-SERVERS.NET"},
                {"ldhName": "B.IANA-SERVERS.NET"}
            ],
            "status": ["client delete prohibited", "client transfer prohibited"],
            "entities": [
                {
                    "handle": "376",
                    "roles": ["registrar"],
                    "vcardArray": ["vcard", [["fn", {}, "text", "RESERVED-Internet Assigned Numbers Authority"]]]
                },
                {
                    "roles": ["registrant"],
                    "vcardArray": ["vcard", [
                        ["fn", {}, "text", "Example Registrant"],
                        ["org", {}, "text", "Example Org"],
                        ["email", {}, "text", "registrant@example.com"],
                        ["tel", {}, "uri", "tel:+1.5555551212"],
                        ["adr", {}, "text", ["", "", "", "Marina del Rey", "CA", "", "US"]]
                    ]]
                }
            ]
        })
    }

    fn rdap_response(body: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(body).insert_header("content-type", "application/rdap+json")
    }

    async fn provider_for(server: &MockServer) -> RdapProvider {
        RdapProvider::with_bootstrap_bases(vec![format!("{}/domain/", server.uri())])
            .unwrap()
            .with_fast_retries()
    }

    #[tokio::test]
    async fn test_query_maps_rdap_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/domain/example.com"))
            .respond_with(rdap_response(rdap_body()))
            .mount(&server)
            .await;

        let provider = provider_for(&server).await;
        let record = provider.query("example.com", Duration::from_secs(2)).await.unwrap();

        assert_eq!(record.domain, "example.com");
        assert!(!record.available);
        assert_eq!(record.registrar.as_deref(), Some("RESERVED-Internet Assigned Numbers Authority"));
        assert_eq!(record.creation_date.as_deref(), Some("1995-08-14"));
        assert_eq!(record.expiry_date.as_deref(), Some("2030-08-13"));
        assert_eq!(record.updated_date.as_deref(), Some("2024-08-14"));
        assert_eq!(record.name_servers, vec!["a.iana-servers.net", "b.iana-servers.net"]);
        assert_eq!(record.domain_status.len(), 2);

        let registrant = record.contacts.unwrap().registrant.unwrap();
        assert_eq!(registrant.name.as_deref(), Some("Example Registrant"));
        assert_eq!(registrant.city.as_deref(), Some("Marina del Rey"));
        assert_eq!(registrant.province.as_deref(), Some("CA"));
        assert_eq!(registrant.country.as_deref(), Some("US"));
    }

    #[tokio::test]
    async fn test_query_treats_404_as_available() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/domain/unregistered-domain.com"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = provider_for(&server).await;
        let record = provider.query("unregistered-domain.com", Duration::from_secs(2)).await.unwrap();

        assert!(record.available);
        assert_eq!(record.status_code, STATUS_NOT_FOUND);
        assert!(!record.is_well_formed());
    }

    #[tokio::test]
    async fn test_redirect_chain_of_three_terminates() {
        let server = MockServer::start().await;
        let uri = server.uri();
        Mock::given(method("GET"))
            .and(path("/domain/example.com"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", format!("{}/hop1", uri).as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hop1"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", format!("{}/hop2", uri).as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hop2"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("location", format!("{}/final", uri).as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/final"))
            .respond_with(rdap_response(rdap_body()))
            .mount(&server)
            .await;

        let provider = provider_for(&server).await;
        let record = provider.query("example.com", Duration::from_secs(2)).await.unwrap();
        assert_eq!(record.creation_date.as_deref(), Some("1995-08-14"));
    }

    #[tokio::test]
    async fn test_redirect_chain_of_four_exceeds_limit() {
        let server = MockServer::start().await;
        let uri = server.uri();
        Mock::given(method("GET"))
            .and(path("/domain/example.com"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", format!("{}/hop1", uri).as_str()),
            )
            .mount(&server)
            .await;
        for (from, to) in [("/hop1", "/hop2"), ("/hop2", "/hop3"), ("/hop3", "/hop4")] {
            Mock::given(method("GET"))
                .and(path(from))
                .respond_with(
                    ResponseTemplate::new(302).insert_header("location", format!("{}{}", uri, to).as_str()),
                )
                .mount(&server)
                .await;
        }

        let provider = provider_for(&server).await;
        let error = provider.query("example.com", Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(error, QueryError::RedirectLimit(_)));
    }

    #[tokio::test]
    async fn test_second_bootstrap_base_tried_on_failure() {
        let primary = MockServer::start().await;
        let secondary = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/domain/example.com"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&primary)
            .await;
        Mock::given(method("GET"))
            .and(path("/domain/example.com"))
            .respond_with(rdap_response(rdap_body()))
            .mount(&secondary)
            .await;

        let provider = RdapProvider::with_bootstrap_bases(vec![
            format!("{}/domain/", primary.uri()),
            format!("{}/domain/", secondary.uri()),
        ])
        .unwrap()
        .with_fast_retries();

        let record = provider.query("example.com", Duration::from_secs(2)).await.unwrap();
        assert_eq!(record.registrar.as_deref(), Some("RESERVED-Internet Assigned Numbers Authority"));
    }

    #[test]
    fn test_rejects_invalid_domain_before_any_request() {
        let provider = RdapProvider::new().unwrap();
        let error = tokio_test::block_on(provider.query("not a domain", Duration::from_secs(1)))
            .unwrap_err();
        assert!(matches!(error, QueryError::InvalidDomain(_)));
    }
}
