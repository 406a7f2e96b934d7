//! Redis-backed result cache with expiry-adaptive TTLs.
//!
//! Domains close to their expiry date change hands and records soon after,
//! so their cached records age out faster. A uniform jitter spreads
//! re-queries so a popular domain's expiry never synchronizes a stampede.

use crate::{errors::QueryError, parser, validate, DomainRecord, STATUS_OK_CACHE};
use rand::Rng;
use redis::{aio::MultiplexedConnection, AsyncCommands};
use std::time::Duration;
use tracing::debug;

const CACHE_PREFIX: &str = "whois:";

// Jitter window added on top of every base TTL
const TTL_JITTER: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct ResultCache {
    conn: MultiplexedConnection,
}

impl ResultCache {
    pub async fn connect(redis_url: &str) -> Result<Self, QueryError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    /// Fetch a cached record. Hits are restamped with the cache status code
    /// and, when the writer left it blank, a `Cache` provenance marker.
    pub async fn get(&self, domain: &str) -> Result<Option<DomainRecord>, QueryError> {
        let key = cache_key(domain);
        let mut conn = self.conn.clone();

        let payload: Option<String> = conn.get(&key).await?;
        let Some(payload) = payload else {
            debug!("Cache miss for domain: {}", domain);
            return Ok(None);
        };

        let mut record: DomainRecord = serde_json::from_str(&payload)
            .map_err(|e| QueryError::BadPayload(format!("corrupt cache entry: {}", e)))?;

        debug!("Cache hit for domain: {}", domain);
        record.status_code = STATUS_OK_CACHE;
        record.status_message = "success from cache".to_string();
        if record.source_provider.is_empty() {
            record.source_provider = "Cache".to_string();
        }

        Ok(Some(record))
    }

    /// Store a well-formed record under its adaptive TTL. Failure records
    /// are silently skipped so a flaky provider can never poison the cache.
    pub async fn put(&self, record: &DomainRecord) -> Result<(), QueryError> {
        if !record.is_well_formed() {
            debug!("Skipping cache write for non-well-formed record: {}", record.domain);
            return Ok(());
        }

        let key = cache_key(&record.domain);
        let mut stamped = record.clone();
        stamped.cached_at = Some(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string());

        let ttl = jittered_ttl(base_ttl(stamped.expiry_date.as_deref()));
        let payload = serde_json::to_string(&stamped)
            .map_err(|e| QueryError::Internal(format!("failed to serialize record: {}", e)))?;

        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(&key, payload, ttl.as_secs()).await?;

        debug!(domain = %record.domain, ttl_secs = ttl.as_secs(), "Cached record");
        Ok(())
    }

    /// Drop a cached record, if any.
    pub async fn invalidate(&self, domain: &str) -> Result<(), QueryError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(cache_key(domain)).await?;
        Ok(())
    }
}

fn cache_key(domain: &str) -> String {
    format!("{}{}", CACHE_PREFIX, validate::sanitize(domain))
}

/// Base TTL derived from how close the domain is to its expiry date.
pub(crate) fn base_ttl(expiry_date: Option<&str>) -> Duration {
    let Some(days_left) = expiry_date.and_then(parser::days_until) else {
        return Duration::from_secs(24 * 3600);
    };

    match days_left {
        d if d <= 15 => Duration::from_secs(3600),
        d if d <= 30 => Duration::from_secs(6 * 3600),
        d if d <= 90 => Duration::from_secs(12 * 3600),
        _ => Duration::from_secs(24 * 3600),
    }
}

/// Uniform jitter in `[0, 24h)` on top of the base; keeps synchronized
/// expirations from re-querying in lockstep.
fn jittered_ttl(base: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..TTL_JITTER.as_secs());
    base + Duration::from_secs(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn expiry_in(days: i64) -> String {
        (Utc::now() + ChronoDuration::days(days)).format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }

    #[test]
    fn test_cache_key_sanitizes_domain() {
        assert_eq!(cache_key("Example.COM."), "whois:example.com");
    }

    #[test]
    fn test_base_ttl_tracks_days_until_expiry() {
        assert_eq!(base_ttl(Some(&expiry_in(10))), Duration::from_secs(3600));
        assert_eq!(base_ttl(Some(&expiry_in(20))), Duration::from_secs(6 * 3600));
        assert_eq!(base_ttl(Some(&expiry_in(60))), Duration::from_secs(12 * 3600));
        assert_eq!(base_ttl(Some(&expiry_in(365))), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_base_ttl_for_expired_domains_is_shortest() {
        assert_eq!(base_ttl(Some(&expiry_in(-5))), Duration::from_secs(3600));
    }

    #[test]
    fn test_base_ttl_defaults_without_parseable_expiry() {
        assert_eq!(base_ttl(None), Duration::from_secs(24 * 3600));
        assert_eq!(base_ttl(Some("sometime soon")), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let base = Duration::from_secs(3600);
        for _ in 0..200 {
            let ttl = jittered_ttl(base);
            assert!(ttl >= base);
            assert!(ttl < base + TTL_JITTER);
        }
    }
}
