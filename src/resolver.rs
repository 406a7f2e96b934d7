//! Resolve orchestration: cache lookup, provider fan-out, and the
//! first-well-formed-answer-wins consumption loop.
//!
//! Every enabled provider is queried in parallel; the primary (picked by the
//! registry's scoring) is launched first so a same-tick race settles in its
//! favor. Outcomes are consumed in arrival order, losers keep running until
//! the winner lands and are then cancelled.

use crate::{
    cache::ResultCache,
    config::Config,
    errors::QueryError,
    registry::ProviderRegistry,
    validate, DomainRecord, ProviderOutcome, STATUS_ALL_FAILED, STATUS_OK, STATUS_TIMEOUT,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

const CACHE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// A resolved record plus its provenance.
#[derive(Debug)]
pub struct Resolution {
    pub record: DomainRecord,
    pub from_cache: bool,
}

impl Resolution {
    fn fresh(record: DomainRecord) -> Self {
        Self { record, from_cache: false }
    }
}

pub struct Resolver {
    registry: Arc<ProviderRegistry>,
    cache: Option<Arc<ResultCache>>,
    config: Arc<Config>,
}

impl Resolver {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        cache: Option<Arc<ResultCache>>,
        config: Arc<Config>,
    ) -> Self {
        Self { registry, cache, config }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Resolve a domain: cache first, then parallel provider fan-out.
    ///
    /// Never returns an `Err`; failures come back as taxonomized records so
    /// the caller always has a status code and message to surface.
    pub async fn resolve(&self, domain: &str) -> Resolution {
        let domain = match validate::validate(domain) {
            Ok(domain) => domain,
            Err(e) => {
                return Resolution::fresh(DomainRecord::failure(
                    domain,
                    e.status_code(),
                    e.to_string(),
                    "All",
                ));
            }
        };

        if let Some(cache) = &self.cache {
            match cache.get(&domain).await {
                Ok(Some(record)) => {
                    return Resolution { record, from_cache: true };
                }
                Ok(None) => {}
                Err(e) => {
                    // A broken cache never blocks a lookup
                    warn!("Cache read error for {}: {}", domain, e);
                }
            }
        }

        let providers = self.registry.enabled_providers().await;
        if providers.is_empty() {
            return Resolution::fresh(DomainRecord::failure(
                &domain,
                STATUS_ALL_FAILED,
                "no providers available",
                "All",
            ));
        }

        self.fan_out(&domain, providers).await
    }

    async fn fan_out(
        &self,
        domain: &str,
        providers: Vec<Arc<dyn crate::Provider>>,
    ) -> Resolution {
        let slow = self.config.is_slow_domain(domain);
        let overall = Duration::from_secs(if slow {
            self.config.slow_resolve_timeout_seconds
        } else {
            self.config.resolve_timeout_seconds
        });
        let primary_timeout = Duration::from_secs(if slow {
            self.config.slow_primary_timeout_seconds
        } else {
            self.config.primary_timeout_seconds
        });
        let secondary_timeout = Duration::from_secs(self.config.primary_timeout_seconds);

        let primary = self.registry.select_primary(&providers).await;
        let primary_name = primary.as_ref().map(|p| p.name()).unwrap_or_default();
        debug!(domain, primary = primary_name, providers = providers.len(), "fanning out");

        // Primary first, so a same-tick race between outcomes settles in its
        // favor when the channel is drained in arrival order.
        let mut ordered = providers;
        if let Some(primary) = &primary {
            ordered.sort_by_key(|p| p.name() != primary.name());
        }

        let total = ordered.len();
        let (tx, mut rx) = mpsc::channel::<ProviderOutcome>(total);
        let done = Arc::new(Notify::new());

        let mut handles = Vec::with_capacity(total);
        for provider in ordered {
            let attempt_timeout =
                if provider.name() == primary_name { primary_timeout } else { secondary_timeout };
            let tx = tx.clone();
            let domain = domain.to_string();

            handles.push(tokio::spawn(async move {
                let result = provider.query(&domain, attempt_timeout).await;
                let _ = tx.send(ProviderOutcome { provider: provider.name().to_string(), result }).await;
            }));
        }
        drop(tx);

        // Passive progress logger; stops at the first outcome
        let progress = tokio::spawn({
            let done = done.clone();
            let domain = domain.to_string();
            async move {
                let mut ticks = tokio::time::interval(Duration::from_secs(5));
                ticks.tick().await;
                loop {
                    tokio::select! {
                        _ = done.notified() => break,
                        _ = ticks.tick() => debug!(%domain, "still waiting on provider outcomes"),
                    }
                }
            }
        });

        let deadline = tokio::time::sleep(overall);
        tokio::pin!(deadline);

        let mut completed = 0usize;
        let mut first_outcome_seen = false;
        let mut last_error: Option<QueryError> = None;

        let resolution = loop {
            tokio::select! {
                _ = &mut deadline => {
                    info!(domain, completed, total, "resolve deadline elapsed");
                    break Resolution::fresh(DomainRecord::failure(
                        domain,
                        STATUS_TIMEOUT,
                        format!(
                            "query timed out after {}s; {} of {} providers completed",
                            overall.as_secs(), completed, total
                        ),
                        "All",
                    ));
                }

                outcome = rx.recv() => {
                    let Some(outcome) = outcome else {
                        break self.all_failed(domain, last_error);
                    };

                    if !first_outcome_seen {
                        first_outcome_seen = true;
                        done.notify_waiters();
                    }

                    completed += 1;
                    match outcome.result {
                        Ok(mut record) => {
                            self.registry.record_success(&outcome.provider).await;

                            if record.is_well_formed() {
                                record.status_code = STATUS_OK;
                                record.status_message = "success".to_string();
                                self.write_cache(&record).await;
                            }
                            info!(domain, provider = %outcome.provider, "resolved");
                            break Resolution::fresh(record);
                        }
                        Err(e) => {
                            debug!(domain, provider = %outcome.provider, "provider failed: {}", e);
                            self.registry.record_failure(&outcome.provider).await;
                            last_error = Some(e);
                            if completed == total {
                                break self.all_failed(domain, last_error);
                            }
                        }
                    }
                }
            }
        };

        // The winner is decided; cancel stragglers so adapter retries stop
        for handle in &handles {
            handle.abort();
        }
        done.notify_waiters();
        progress.abort();

        resolution
    }

    fn all_failed(&self, domain: &str, last_error: Option<QueryError>) -> Resolution {
        let (status, message) = match &last_error {
            Some(QueryError::Timeout) => {
                (STATUS_TIMEOUT, "all providers timed out".to_string())
            }
            Some(e) if e.is_rate_limit() => {
                (crate::STATUS_RATE_LIMITED, "all providers rate limited".to_string())
            }
            Some(QueryError::InvalidDomain(msg)) => {
                (crate::STATUS_INVALID_DOMAIN, msg.clone())
            }
            Some(e) => (STATUS_ALL_FAILED, format!("all providers failed: {}", e)),
            None => (STATUS_ALL_FAILED, "all providers failed".to_string()),
        };

        Resolution::fresh(DomainRecord::failure(domain, status, message, "All"))
    }

    async fn write_cache(&self, record: &DomainRecord) {
        let Some(cache) = &self.cache else { return };

        match tokio::time::timeout(CACHE_WRITE_TIMEOUT, cache.put(record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to cache result for {}: {}", record.domain, e),
            Err(_) => warn!("Cache write timeout for {}", record.domain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Provider, ProviderKind};
    use crate::registry::ProviderRegistry;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Instant;

    type Script = Box<dyn Fn() -> Result<DomainRecord, QueryError> + Send + Sync>;

    struct MockProvider {
        name: &'static str,
        delay: Option<Duration>,
        script: Script,
    }

    impl MockProvider {
        fn succeeding(name: &'static str, delay: Option<Duration>) -> Arc<Self> {
            Arc::new(Self {
                name,
                delay,
                script: Box::new(move || {
                    let mut record = DomainRecord::empty("example.com");
                    record.source_provider = name.to_string();
                    record.registrar = Some("IANA".to_string());
                    record.expiry_date = Some("2030-12-31".to_string());
                    record.normalize();
                    Ok(record)
                }),
            })
        }

        fn failing(name: &'static str, delay: Option<Duration>, error: fn() -> QueryError) -> Arc<Self> {
            Arc::new(Self { name, delay, script: Box::new(move || Err(error())) })
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &'static str {
            self.name
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::HttpJson
        }
        async fn query(&self, _: &str, _: Duration) -> Result<DomainRecord, QueryError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.script)()
        }
    }

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.resolve_timeout_seconds = 2;
        config.slow_resolve_timeout_seconds = 2;
        Arc::new(config)
    }

    async fn resolver_with(providers: Vec<Arc<MockProvider>>) -> Resolver {
        let mut registry = ProviderRegistry::new();
        let names: Vec<&'static str> = providers.iter().map(|p| p.name).collect();
        for provider in providers {
            registry.register(provider);
        }
        for name in names {
            registry.force_state(name, true, 0, 0, Utc::now()).await;
        }
        Resolver::new(Arc::new(registry), None, test_config())
    }

    #[tokio::test]
    async fn test_primary_win_returns_its_record() {
        let resolver = resolver_with(vec![
            MockProvider::succeeding("P1", None),
            MockProvider::succeeding("P2", Some(Duration::from_millis(200))),
        ])
        .await;

        let resolution = resolver.resolve("example.com").await;
        assert!(!resolution.from_cache);
        assert_eq!(resolution.record.status_code, STATUS_OK);
        assert_eq!(resolution.record.source_provider, "P1");
        assert_eq!(resolution.record.registrar.as_deref(), Some("IANA"));

        let (_, _, calls) = resolver.registry().status_of("P1").await.unwrap();
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_failover_to_secondary() {
        let resolver = resolver_with(vec![
            MockProvider::failing("P1", None, || QueryError::Timeout),
            MockProvider::succeeding("P2", Some(Duration::from_millis(100))),
        ])
        .await;

        let start = Instant::now();
        let resolution = resolver.resolve("example.com").await;
        assert!(start.elapsed() < Duration::from_secs(1));

        assert_eq!(resolution.record.source_provider, "P2");
        assert_eq!(resolution.record.status_code, STATUS_OK);

        let (enabled, errors, _) = resolver.registry().status_of("P1").await.unwrap();
        assert!(enabled);
        assert_eq!(errors, 1);
        let (_, _, calls) = resolver.registry().status_of("P2").await.unwrap();
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_all_failed_maps_to_503_and_disables_after_two_rounds() {
        let resolver = resolver_with(vec![
            MockProvider::failing("P1", None, || QueryError::Internal("boom".to_string())),
            MockProvider::failing("P2", None, || QueryError::Internal("boom".to_string())),
        ])
        .await;

        let resolution = resolver.resolve("example.com").await;
        assert_eq!(resolution.record.status_code, STATUS_ALL_FAILED);
        assert_eq!(resolution.record.source_provider, "All");

        let resolution = resolver.resolve("example.com").await;
        assert_eq!(resolution.record.status_code, STATUS_ALL_FAILED);

        let (enabled, errors, _) = resolver.registry().status_of("P1").await.unwrap();
        assert!(!enabled);
        assert_eq!(errors, 2);
        let (enabled, _, _) = resolver.registry().status_of("P2").await.unwrap();
        assert!(!enabled);

        // Third round finds nobody in rotation
        let resolution = resolver.resolve("example.com").await;
        assert_eq!(resolution.record.status_code, STATUS_ALL_FAILED);
        assert!(resolution.record.status_message.contains("no providers"));
    }

    #[tokio::test]
    async fn test_cooldown_reenables_and_resolve_proceeds() {
        let resolver = resolver_with(vec![MockProvider::succeeding("P1", None)]).await;

        // Disabled and past cooldown
        let past = Utc::now() - chrono::Duration::minutes(5) - chrono::Duration::seconds(1);
        resolver.registry().force_state("P1", false, 2, 5, past).await;

        let resolution = resolver.resolve("example.com").await;
        assert_eq!(resolution.record.status_code, STATUS_OK);
        let (enabled, errors, calls) = resolver.registry().status_of("P1").await.unwrap();
        assert!(enabled);
        assert_eq!(errors, 0);
        // Counters were reset at revival, then the winning call counted
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_global_timeout_returns_408_promptly() {
        let resolver = resolver_with(vec![
            MockProvider::succeeding("P1", Some(Duration::from_secs(30))),
            MockProvider::succeeding("P2", Some(Duration::from_secs(30))),
        ])
        .await;

        let start = Instant::now();
        let resolution = resolver.resolve("example.com").await;
        let elapsed = start.elapsed();

        assert_eq!(resolution.record.status_code, STATUS_TIMEOUT);
        assert!(resolution.record.status_message.contains("0 of 2"));
        // Within deadline + 2s
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_all_timeouts_map_to_408() {
        let resolver = resolver_with(vec![
            MockProvider::failing("P1", None, || QueryError::Timeout),
            MockProvider::failing("P2", None, || QueryError::Timeout),
        ])
        .await;

        let resolution = resolver.resolve("example.com").await;
        assert_eq!(resolution.record.status_code, STATUS_TIMEOUT);
    }

    #[tokio::test]
    async fn test_all_rate_limited_maps_to_429() {
        let resolver = resolver_with(vec![
            MockProvider::failing("P1", None, || QueryError::RateLimited("P1".to_string())),
            MockProvider::failing("P2", None, || QueryError::RateLimited("P2".to_string())),
        ])
        .await;

        let resolution = resolver.resolve("example.com").await;
        assert_eq!(resolution.record.status_code, crate::STATUS_RATE_LIMITED);
    }

    #[tokio::test]
    async fn test_invalid_domain_short_circuits_without_fanout() {
        let resolver = resolver_with(vec![MockProvider::succeeding("P1", None)]).await;

        let resolution = resolver.resolve("not a domain").await;
        assert_eq!(resolution.record.status_code, crate::STATUS_INVALID_DOMAIN);

        let (_, _, calls) = resolver.registry().status_of("P1").await.unwrap();
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_same_tick_race_settles_for_primary() {
        let resolver = resolver_with(vec![
            MockProvider::succeeding("P1", None),
            MockProvider::succeeding("P2", None),
        ])
        .await;

        // Make P2 the primary by score
        resolver.registry().force_state("P1", true, 0, 50, Utc::now()).await;
        resolver.registry().force_state("P2", true, 0, 0, Utc::now()).await;

        let resolution = resolver.resolve("example.com").await;
        assert_eq!(resolution.record.source_provider, "P2");
    }

    #[tokio::test]
    async fn test_available_answer_wins_but_is_not_restamped() {
        let available = Arc::new(MockProvider {
            name: "P1",
            delay: None,
            script: Box::new(|| {
                let mut record = DomainRecord::failure(
                    "unregistered-domain.com",
                    crate::STATUS_NOT_FOUND,
                    "domain not registered",
                    "P1",
                );
                record.available = true;
                Ok(record)
            }),
        });
        let resolver = resolver_with(vec![available]).await;

        let resolution = resolver.resolve("unregistered-domain.com").await;
        assert!(resolution.record.available);
        // Not well-formed, so the adapter's status class is preserved
        assert_eq!(resolution.record.status_code, crate::STATUS_NOT_FOUND);
    }
}
