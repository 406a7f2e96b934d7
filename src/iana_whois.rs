//! IANA WHOIS text-protocol provider adapter.
//!
//! Speaks classic port-43 WHOIS: a hardcoded fast path covers the popular
//! TLDs, everything else is discovered through a referral query against
//! `whois.iana.org`. Responses are parsed into the same unified record the
//! JSON adapters produce.

use crate::{
    config::Config,
    errors::QueryError,
    parser::WhoisTextParser,
    provider::{Provider, ProviderKind, RetryPlan, MAX_ATTEMPTS},
    validate, DomainRecord, STATUS_NOT_FOUND,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{RwLock, Semaphore},
    time::timeout,
};
use tracing::{debug, warn};

// Standard whois protocol port
const WHOIS_PORT: u16 = 43;

const IANA_WHOIS_SERVER: &str = "whois.iana.org";

// Fast path for the TLDs that carry most traffic; everything else goes
// through IANA referral discovery
static TLD_WHOIS_SERVERS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut map = HashMap::new();

    map.insert("com", "whois.verisign-grs.com");
    map.insert("net", "whois.verisign-grs.com");
    map.insert("org", "whois.pir.org");
    map.insert("info", "whois.afilias.net");
    map.insert("io", "whois.nic.io");
    map.insert("co", "whois.nic.co");
    map.insert("ai", "whois.nic.ai");
    map.insert("dev", "whois.nic.google");
    map.insert("app", "whois.nic.google");
    map.insert("xyz", "whois.nic.xyz");
    map.insert("me", "whois.nic.me");
    map.insert("tv", "whois.nic.tv");
    map.insert("cc", "ccwhois.verisign-grs.com");
    map.insert("uk", "whois.nic.uk");
    map.insert("co.uk", "whois.nic.uk");
    map.insert("de", "whois.denic.de");
    map.insert("fr", "whois.afnic.fr");
    map.insert("nl", "whois.domain-registry.nl");
    map.insert("eu", "whois.eu");
    map.insert("cn", "whois.cnnic.cn");
    map.insert("jp", "whois.jprs.jp");
    map.insert("kr", "whois.kr");
    map.insert("ru", "whois.tcinet.ru");
    map.insert("br", "whois.registro.br");
    map.insert("au", "whois.auda.org.au");

    map
});

// Registries phrase "this name is free" a dozen different ways
const AVAILABILITY_MARKERS: [&str; 5] = [
    "no match for",
    "not found",
    "no data found",
    "no entries found",
    "domain not found",
];

pub struct IanaWhoisProvider {
    tld_servers: Arc<RwLock<HashMap<String, String>>>,
    query_semaphore: Arc<Semaphore>,
    retry: RetryPlan,
    parser: WhoisTextParser,
    max_referrals: usize,
    max_response_size: usize,
    attempt_cap: Duration,
}

impl IanaWhoisProvider {
    pub fn new(config: &Config) -> Self {
        Self {
            tld_servers: Arc::new(RwLock::new(HashMap::new())),
            query_semaphore: Arc::new(Semaphore::new(config.concurrent_whois_queries)),
            retry: RetryPlan::default(),
            parser: WhoisTextParser::new(),
            max_referrals: config.max_referrals,
            max_response_size: config.max_response_size,
            attempt_cap: Duration::from_secs(config.attempt_timeout_seconds),
        }
    }

    async fn find_whois_server(
        &self,
        tld: &str,
        attempt_timeout: Duration,
    ) -> Result<String, QueryError> {
        {
            let servers = self.tld_servers.read().await;
            if let Some(server) = servers.get(tld) {
                debug!("Using cached whois server for {}: {}", tld, server);
                return Ok(server.clone());
            }
        }

        if let Some(server) = TLD_WHOIS_SERVERS.get(tld) {
            return Ok(server.to_string());
        }

        // Referral discovery through the IANA root database
        let response = self.raw_query(IANA_WHOIS_SERVER, tld, attempt_timeout).await?;
        match extract_referral(&response) {
            Some(server) => {
                let mut servers = self.tld_servers.write().await;
                servers.insert(tld.to_string(), server.clone());
                debug!("Discovered whois server for {}: {}", tld, server);
                Ok(server)
            }
            None => Err(QueryError::UnsupportedTld(tld.to_string())),
        }
    }

    async fn raw_query(
        &self,
        server: &str,
        query: &str,
        attempt_timeout: Duration,
    ) -> Result<String, QueryError> {
        let attempt_timeout = attempt_timeout.min(self.attempt_cap);
        let _permit = self
            .query_semaphore
            .acquire()
            .await
            .map_err(|_| QueryError::Internal("query semaphore closed".to_string()))?;

        let mut stream =
            timeout(attempt_timeout, TcpStream::connect((server, WHOIS_PORT))).await??;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        stream.write_all(format!("{}\r\n", query).as_bytes()).await?;

        let mut response = Vec::new();
        let mut buffer = vec![0u8; 8192];
        loop {
            match timeout(attempt_timeout, stream.read(&mut buffer)).await? {
                Ok(0) => break, // EOF
                Ok(n) => {
                    response.extend_from_slice(&buffer[..n]);
                    if response.len() > self.max_response_size {
                        return Err(QueryError::ResponseTooLarge);
                    }
                }
                Err(e) => return Err(QueryError::IoError(e)),
            }
        }

        String::from_utf8(response).map_err(|_| QueryError::InvalidUtf8)
    }

    async fn query_with_retries(
        &self,
        server: &str,
        domain: &str,
        attempt_timeout: Duration,
    ) -> Result<String, QueryError> {
        let mut last_error = QueryError::Timeout;

        for attempt in 0..MAX_ATTEMPTS {
            match self.raw_query(server, domain, attempt_timeout).await {
                Ok(response) => return Ok(response),
                Err(e @ (QueryError::Timeout | QueryError::IoError(_))) => {
                    debug!(server, attempt = attempt + 1, "whois attempt failed: {}", e);
                    last_error = e;
                    if attempt + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(self.retry.backoff(attempt, false)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    async fn follow_referrals(
        &self,
        initial_server: String,
        initial_data: String,
        domain: &str,
        attempt_timeout: Duration,
    ) -> (String, String) {
        let mut current_server = initial_server;
        let mut current_data = initial_data;

        for _ in 0..self.max_referrals {
            let Some(referral) = extract_referral(&current_data) else { break };
            if referral == current_server {
                break;
            }

            debug!("Following referral from {} to {}", current_server, referral);
            match self.query_with_retries(&referral, domain, attempt_timeout).await {
                Ok(new_data) => {
                    current_server = referral;
                    current_data = new_data;
                }
                Err(e) => {
                    warn!("Failed to query referral server {}: {}", referral, e);
                    break;
                }
            }
        }

        (current_server, current_data)
    }
}

#[async_trait]
impl Provider for IanaWhoisProvider {
    fn name(&self) -> &'static str {
        "IANA-WHOIS"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::WhoisText
    }

    async fn query(
        &self,
        domain: &str,
        attempt_timeout: Duration,
    ) -> Result<DomainRecord, QueryError> {
        let domain = validate::validate(domain)?;
        let tld = validate::extract_tld(&domain)?;

        let server = self.find_whois_server(&tld, attempt_timeout).await?;
        let data = self.query_with_retries(&server, &domain, attempt_timeout).await?;
        let (final_server, final_data) =
            self.follow_referrals(server, data, &domain, attempt_timeout).await;

        if is_availability_response(&final_data) {
            let mut record = DomainRecord::failure(
                &domain,
                STATUS_NOT_FOUND,
                "domain not registered",
                self.name(),
            );
            record.available = true;
            return Ok(record);
        }

        let mut record = DomainRecord::empty(&domain);
        record.source_provider = self.name().to_string();
        if !self.parser.parse_into(&final_data, &mut record) {
            return Err(QueryError::BadPayload("no recognizable whois fields".to_string()));
        }
        record.whois_server = Some(final_server);
        record.normalize();
        Ok(record)
    }
}

/// Find a `whois:`/`refer:`/`whois server:` referral line.
fn extract_referral(data: &str) -> Option<String> {
    for line in data.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else { continue };
        let key = key.trim().to_lowercase();
        let value = value.trim();

        if value.is_empty() {
            continue;
        }
        if (key.contains("whois") && key.contains("server")) || key == "whois" || key == "refer" {
            return Some(value.to_string());
        }
    }
    None
}

fn is_availability_response(data: &str) -> bool {
    let head: String = data.lines().take(10).collect::<Vec<_>>().join("\n").to_lowercase();
    AVAILABILITY_MARKERS.iter().any(|marker| head.contains(marker))
}
