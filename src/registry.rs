//! Provider registry and scheduler.
//!
//! Owns every provider descriptor and its live usage state. Selection scores
//! favor providers that are fresh, healthy, and lightly used; repeated
//! failures disable a provider until a cooldown re-admits it with clean
//! counters. Adapters themselves stay stateless.

use crate::{
    config::Config,
    errors::QueryError,
    iana_whois::IanaWhoisProvider,
    provider::{Provider, ProviderKind},
    rdap::RdapProvider,
    whoisfreaks::WhoisFreaksProvider,
    whoisxml::WhoisXmlProvider,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Consecutive failures before a provider is taken out of rotation.
const MAX_CONSECUTIVE_ERRORS: u32 = 2;

/// How long a disabled provider sits out before being retried, in seconds.
const COOLDOWN_SECS: i64 = 5 * 60;

/// Live usage state for one provider.
#[derive(Debug, Clone)]
struct ProviderState {
    enabled: bool,
    consecutive_errors: u32,
    call_count: u64,
    last_used: DateTime<Utc>,
}

/// Read-only view of a provider's descriptor for the health API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderStatusView {
    pub id: String,
    pub kind: ProviderKind,
    pub enabled: bool,
    pub consecutive_errors: u32,
    pub call_count: u64,
    pub last_used: DateTime<Utc>,
}

/// Rollup over all providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Up,
    Degraded,
    Down,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OverallStatus {
    pub total: usize,
    pub available: usize,
    pub status: ServiceStatus,
}

pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
    state: RwLock<HashMap<String, ProviderState>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self { providers: Vec::new(), state: RwLock::new(HashMap::new()) }
    }

    /// Build the registry from configuration: RDAP and the IANA text
    /// protocol are always available, the commercial JSON vendors join when
    /// their API keys are configured.
    pub fn from_config(config: &Config) -> Result<Self, QueryError> {
        let mut registry = Self::new();
        let attempt_cap = Duration::from_secs(config.attempt_timeout_seconds);

        registry.register(Arc::new(RdapProvider::new()?.with_attempt_cap(attempt_cap)));
        registry.register(Arc::new(IanaWhoisProvider::new(config)));

        if let Some(key) = &config.whoisfreaks_api_key {
            registry
                .register(Arc::new(WhoisFreaksProvider::new(key.clone())?.with_attempt_cap(attempt_cap)));
        } else {
            info!("WhoisFreaks API key not configured, provider skipped");
        }

        if let Some(key) = &config.whoisxml_api_key {
            registry
                .register(Arc::new(WhoisXmlProvider::new(key.clone())?.with_attempt_cap(attempt_cap)));
        } else {
            info!("WhoisXML API key not configured, provider skipped");
        }

        Ok(registry)
    }

    /// Register a provider. Counters are seeded with a little randomness so
    /// two identical deployments do not hammer the same primary.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let id = provider.name().to_string();
        let mut rng = rand::thread_rng();
        let state = ProviderState {
            enabled: true,
            consecutive_errors: 0,
            call_count: rng.gen_range(0..=1),
            last_used: Utc::now() - ChronoDuration::seconds(rng.gen_range(0..600)),
        };

        // Exactly one descriptor per provider id
        self.state
            .try_write()
            .expect("registry seeded before concurrent use")
            .insert(id.clone(), state);
        self.providers.retain(|p| p.name() != id);
        self.providers.push(provider);
        info!(provider = %id, "Registered provider");
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn provider_by_name(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    pub fn all_providers(&self) -> Vec<Arc<dyn Provider>> {
        self.providers.clone()
    }

    /// Enabled providers, after re-admitting any whose cooldown elapsed.
    pub async fn enabled_providers(&self) -> Vec<Arc<dyn Provider>> {
        self.revive_cooled_down().await;

        let state = self.state.read().await;
        self.providers
            .iter()
            .filter(|p| state.get(p.name()).map_or(false, |s| s.enabled))
            .cloned()
            .collect()
    }

    /// Pick the preferred provider among candidates: lowest score wins,
    /// first-registered wins ties.
    pub async fn select_primary(
        &self,
        candidates: &[Arc<dyn Provider>],
    ) -> Option<Arc<dyn Provider>> {
        let state = self.state.read().await;
        let now = Utc::now();

        let mut best: Option<(f64, &Arc<dyn Provider>)> = None;
        for provider in candidates {
            let Some(s) = state.get(provider.name()) else { continue };
            let score = selection_score(s, now);
            match &best {
                Some((best_score, _)) if score >= *best_score => {}
                _ => best = Some((score, provider)),
            }
        }

        best.map(|(_, p)| p.clone())
    }

    /// Success path: clear the error streak, bump usage, re-enable.
    pub async fn record_success(&self, provider: &str) {
        let mut state = self.state.write().await;
        if let Some(s) = state.get_mut(provider) {
            s.consecutive_errors = 0;
            s.call_count += 1;
            s.last_used = Utc::now();
            s.enabled = true;
        }
    }

    /// Failure path: advance the streak; at the threshold the provider is
    /// pulled from rotation until the cooldown passes.
    pub async fn record_failure(&self, provider: &str) {
        let mut state = self.state.write().await;
        if let Some(s) = state.get_mut(provider) {
            s.consecutive_errors += 1;
            s.last_used = Utc::now();
            if s.consecutive_errors >= MAX_CONSECUTIVE_ERRORS && s.enabled {
                s.enabled = false;
                warn!(provider, errors = s.consecutive_errors, "Provider disabled after consecutive failures");
            }
        }
    }

    /// Per-provider status snapshot in registration order.
    pub async fn provider_statuses(&self) -> Vec<ProviderStatusView> {
        let state = self.state.read().await;
        self.providers
            .iter()
            .filter_map(|p| {
                state.get(p.name()).map(|s| ProviderStatusView {
                    id: p.name().to_string(),
                    kind: p.kind(),
                    enabled: s.enabled,
                    consecutive_errors: s.consecutive_errors,
                    call_count: s.call_count,
                    last_used: s.last_used,
                })
            })
            .collect()
    }

    /// Whole-service rollup derived from enablement.
    pub async fn overall_status(&self) -> OverallStatus {
        let state = self.state.read().await;
        let total = self.providers.len();
        let available = self
            .providers
            .iter()
            .filter(|p| state.get(p.name()).map_or(false, |s| s.enabled))
            .count();

        OverallStatus { total, available, status: rollup_status(total, available) }
    }

    async fn revive_cooled_down(&self) {
        let now = Utc::now();

        // Cheap read-side check first; the write lock is only taken when a
        // revival is actually due.
        let cooled = |s: &ProviderState| {
            !s.enabled && (now - s.last_used).num_seconds() > COOLDOWN_SECS
        };

        {
            let state = self.state.read().await;
            if !state.values().any(|s| cooled(s)) {
                return;
            }
        }

        let mut state = self.state.write().await;
        for (id, s) in state.iter_mut() {
            if cooled(s) {
                s.enabled = true;
                s.consecutive_errors = 0;
                s.call_count = 0;
                info!(provider = %id, "Provider re-enabled after cooldown");
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn force_state(
        &self,
        provider: &str,
        enabled: bool,
        consecutive_errors: u32,
        call_count: u64,
        last_used: DateTime<Utc>,
    ) {
        let mut state = self.state.write().await;
        if let Some(s) = state.get_mut(provider) {
            s.enabled = enabled;
            s.consecutive_errors = consecutive_errors;
            s.call_count = call_count;
            s.last_used = last_used;
        }
    }

    #[cfg(test)]
    pub(crate) async fn status_of(&self, provider: &str) -> Option<(bool, u32, u64)> {
        let state = self.state.read().await;
        state.get(provider).map(|s| (s.enabled, s.consecutive_errors, s.call_count))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lower is better: heavy recent use and error streaks push a provider down
/// the ranking, idle time pulls it back up.
fn selection_score(state: &ProviderState, now: DateTime<Utc>) -> f64 {
    let minutes_idle = (now - state.last_used).num_seconds() as f64 / 60.0;
    10.0 * state.call_count as f64 + 20.0 * state.consecutive_errors as f64 - 5.0 * minutes_idle
}

fn rollup_status(total: usize, available: usize) -> ServiceStatus {
    if total == 0 || available == 0 {
        ServiceStatus::Down
    } else if available < total {
        ServiceStatus::Degraded
    } else {
        ServiceStatus::Up
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DomainRecord;
    use async_trait::async_trait;
    use std::time::Duration;

    struct StubProvider(&'static str);

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &'static str {
            self.0
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::HttpJson
        }
        async fn query(&self, domain: &str, _: Duration) -> Result<DomainRecord, QueryError> {
            Ok(DomainRecord::empty(domain))
        }
    }

    async fn registry_with(names: &[&'static str]) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for name in names {
            registry.register(Arc::new(StubProvider(name)));
        }
        // Level the random seeding so tests are deterministic
        for name in names {
            registry.force_state(name, true, 0, 0, Utc::now()).await;
        }
        registry
    }

    #[tokio::test]
    async fn test_selection_prefers_lightly_used_provider() {
        let registry = registry_with(&["A", "B"]).await;
        registry.force_state("A", true, 0, 0, Utc::now()).await;
        registry.force_state("B", true, 0, 10, Utc::now()).await;

        let candidates = registry.enabled_providers().await;
        let primary = registry.select_primary(&candidates).await.unwrap();
        assert_eq!(primary.name(), "A");
    }

    #[tokio::test]
    async fn test_selection_switches_after_usage_accumulates() {
        let registry = registry_with(&["A", "B"]).await;
        registry.force_state("B", true, 0, 10, Utc::now()).await;

        // Drive A's call count past B's score
        for _ in 0..11 {
            registry.record_success("A").await;
        }

        let candidates = registry.enabled_providers().await;
        let primary = registry.select_primary(&candidates).await.unwrap();
        assert_eq!(primary.name(), "B");
    }

    #[tokio::test]
    async fn test_error_streak_penalizes_selection() {
        let registry = registry_with(&["A", "B"]).await;
        registry.force_state("A", true, 1, 0, Utc::now()).await;

        let candidates = registry.enabled_providers().await;
        let primary = registry.select_primary(&candidates).await.unwrap();
        assert_eq!(primary.name(), "B");
    }

    #[tokio::test]
    async fn test_two_failures_disable_provider() {
        let registry = registry_with(&["A", "B"]).await;

        registry.record_failure("A").await;
        let (enabled, errors, _) = registry.status_of("A").await.unwrap();
        assert!(enabled);
        assert_eq!(errors, 1);

        registry.record_failure("A").await;
        let (enabled, errors, _) = registry.status_of("A").await.unwrap();
        assert!(!enabled);
        assert_eq!(errors, 2);

        let candidates = registry.enabled_providers().await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name(), "B");
    }

    #[tokio::test]
    async fn test_cooldown_revives_with_clean_counters() {
        let registry = registry_with(&["A"]).await;

        registry.record_failure("A").await;
        registry.record_failure("A").await;
        assert!(registry.enabled_providers().await.is_empty());

        // Rewind last_used past the cooldown
        let past = Utc::now() - ChronoDuration::minutes(5) - ChronoDuration::seconds(1);
        registry.force_state("A", false, 2, 7, past).await;

        let candidates = registry.enabled_providers().await;
        assert_eq!(candidates.len(), 1);
        let (enabled, errors, calls) = registry.status_of("A").await.unwrap();
        assert!(enabled);
        assert_eq!(errors, 0);
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_success_resets_streak_and_reenables() {
        let registry = registry_with(&["A"]).await;
        registry.force_state("A", false, 2, 3, Utc::now()).await;

        registry.record_success("A").await;
        let (enabled, errors, calls) = registry.status_of("A").await.unwrap();
        assert!(enabled);
        assert_eq!(errors, 0);
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn test_overall_status_rollup() {
        let registry = registry_with(&["A", "B"]).await;
        assert_eq!(registry.overall_status().await.status, ServiceStatus::Up);

        registry.record_failure("A").await;
        registry.record_failure("A").await;
        let overall = registry.overall_status().await;
        assert_eq!(overall.status, ServiceStatus::Degraded);
        assert_eq!(overall.available, 1);

        registry.record_failure("B").await;
        registry.record_failure("B").await;
        assert_eq!(registry.overall_status().await.status, ServiceStatus::Down);
    }

    #[tokio::test]
    async fn test_registering_same_id_replaces_descriptor() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StubProvider("A")));
        registry.register(Arc::new(StubProvider("A")));
        assert_eq!(registry.provider_count(), 1);
    }
}
