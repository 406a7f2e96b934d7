use crate::{Contact, ContactSet, DomainRecord};
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::debug;

/// Parse various date formats commonly found in registration data.
///
/// Providers disagree wildly here: RDAP servers emit RFC 3339, port-43
/// registries emit a dozen regional formats.
pub fn parse_datetime(date_str: &str) -> Option<DateTime<Utc>> {
    let date_str = date_str.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(date_str) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = [
        "%Y-%m-%dT%H:%M:%S%.fZ",  // 2025-05-18T13:36:06.0Z
        "%Y-%m-%dT%H:%M:%S%z",    // 2025-05-18T13:36:06+0000
        "%Y-%m-%d %H:%M:%S",      // 2025-05-18 13:36:06
        "%d-%b-%Y %H:%M:%S",      // 18-May-2025 13:36:06
    ];

    for format in &formats {
        if let Ok(dt) = DateTime::parse_from_str(date_str, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    for format in &formats {
        if let Ok(naive_dt) = NaiveDateTime::parse_from_str(date_str, format) {
            return Some(DateTime::from_naive_utc_and_offset(naive_dt, Utc));
        }
    }

    // Date-only forms, assumed midnight UTC
    let date_only_formats = [
        "%Y-%m-%d",  // 2025-05-18
        "%d-%b-%Y",  // 18-May-2025
        "%d %b %Y",  // 18 May 2025
        "%Y/%m/%d",  // 2025/05/18
        "%m/%d/%Y",  // 05/18/2025
        "%d.%m.%Y",  // 18.05.2025
        "%Y.%m.%d",  // 2025.05.18
    ];

    for format in &date_only_formats {
        if let Ok(naive_date) = chrono::NaiveDate::parse_from_str(date_str, format) {
            if let Some(naive_dt) = naive_date.and_hms_opt(0, 0, 0) {
                return Some(DateTime::from_naive_utc_and_offset(naive_dt, Utc));
            }
        }
    }

    debug!("Failed to parse date: {}", date_str);
    None
}

/// Normalize a provider-reported date to `YYYY-MM-DD`; unparseable input is
/// passed through trimmed so the caller never loses data.
pub fn normalize_date(date_str: &str) -> Option<String> {
    let trimmed = date_str.trim();
    if trimmed.is_empty() {
        return None;
    }
    match parse_datetime(trimmed) {
        Some(dt) => Some(dt.format("%Y-%m-%d").to_string()),
        None => Some(trimmed.to_string()),
    }
}

/// Days from now until the given date; negative when already past.
pub fn days_until(date_str: &str) -> Option<i64> {
    parse_datetime(date_str).map(|dt| (dt - Utc::now()).num_days())
}

/// Key/value WHOIS text parser for port-43 responses.
pub struct WhoisTextParser;

impl WhoisTextParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a raw WHOIS response into the unified record's registration
    /// fields. Returns false when no recognizable field was found.
    pub fn parse_into(&self, data: &str, record: &mut DomainRecord) -> bool {
        let mut matched = false;
        let mut registrant = Contact::default();
        let mut admin = Contact::default();
        let mut tech = Contact::default();

        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('%') || line.starts_with('#') || line.starts_with(">>>") {
                continue;
            }

            let Some((key, value)) = line.split_once(':') else { continue };
            let key = key.trim().to_lowercase();
            let value = value.trim();
            if value.is_empty() {
                continue;
            }

            // Order matters - most specific patterns first
            match key.as_str() {
                k if k.contains("expir") => {
                    if record.expiry_date.is_none() {
                        record.expiry_date = normalize_date(value);
                        matched = true;
                    }
                }

                k if k.contains("creation") || k.contains("created") || k == "registered" => {
                    if record.creation_date.is_none() {
                        record.creation_date = normalize_date(value);
                        matched = true;
                    }
                }

                k if k.contains("updated") || k.contains("modified") || k.contains("changed") => {
                    if record.updated_date.is_none() {
                        record.updated_date = normalize_date(value);
                        matched = true;
                    }
                }

                k if (k.contains("whois") && k.contains("server")) || k == "refer" => {
                    if record.whois_server.is_none() {
                        record.whois_server = Some(value.to_string());
                        matched = true;
                    }
                }

                k if k.contains("registrar")
                    && !k.contains("url")
                    && !k.contains("abuse")
                    && !k.contains("iana")
                    && !k.contains("registration") =>
                {
                    if record.registrar.is_none() {
                        record.registrar = Some(value.to_string());
                        matched = true;
                    }
                }

                k if k.contains("name server") || k == "nserver" || k == "ns" => {
                    // Some registries append the glue address after the hostname
                    let server = value.split_whitespace().next().unwrap_or(value);
                    record.name_servers.push(server.to_string());
                    matched = true;
                }

                k if k.contains("status") || k == "state" => {
                    // Strip the ICANN explanation URL suffix
                    let token = value.split_whitespace().next().unwrap_or(value);
                    if !record.domain_status.iter().any(|s| s == token) {
                        record.domain_status.push(token.to_string());
                    }
                    matched = true;
                }

                k if k.starts_with("registrant") => {
                    Self::assign_contact_field(&mut registrant, k, value);
                    matched = true;
                }
                k if k.starts_with("admin") => {
                    Self::assign_contact_field(&mut admin, k, value);
                    matched = true;
                }
                k if k.starts_with("tech") => {
                    Self::assign_contact_field(&mut tech, k, value);
                    matched = true;
                }

                _ => {} // Ignore unrecognized fields
            }
        }

        if !registrant.is_empty() || !admin.is_empty() || !tech.is_empty() {
            record.contacts = Some(ContactSet {
                registrant: (!registrant.is_empty()).then_some(registrant),
                admin: (!admin.is_empty()).then_some(admin),
                tech: (!tech.is_empty()).then_some(tech),
            });
        }

        matched
    }

    fn assign_contact_field(contact: &mut Contact, key: &str, value: &str) {
        // Registries redact with placeholder text rather than omitting fields
        if value.to_lowercase().contains("select request") || value.to_lowercase().contains("redacted") {
            return;
        }

        if key.contains("email") {
            contact.email.get_or_insert_with(|| value.to_string());
        } else if key.contains("phone") {
            contact.phone.get_or_insert_with(|| value.to_string());
        } else if key.contains("organi") || key.contains("org") {
            contact.organization.get_or_insert_with(|| value.to_string());
        } else if key.contains("country") {
            contact.country.get_or_insert_with(|| value.to_string());
        } else if key.contains("state") || key.contains("province") {
            contact.province.get_or_insert_with(|| value.to_string());
        } else if key.contains("city") {
            contact.city.get_or_insert_with(|| value.to_string());
        } else if key.contains("name") || key == "registrant" {
            contact.name.get_or_insert_with(|| value.to_string());
        }
    }
}

impl Default for WhoisTextParser {
    fn default() -> Self {
        Self::new()
    }
}
