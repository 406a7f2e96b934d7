//! Periodic provider health probe and the aggregated health snapshot.
//!
//! Each cycle exercises every registered provider against a random canary
//! domain, scoring the probe exactly like real traffic. The registry's write
//! lock is only taken for the brief state update after the outbound call has
//! already returned.

use crate::{
    breaker::{BreakerState, CircuitBreaker},
    config::Config,
    registry::{OverallStatus, ProviderRegistry, ProviderStatusView},
};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// Stable, heavily-registered names that exercise a provider end to end
// without touching real traffic patterns
const CANARY_DOMAINS: [&str; 3] = ["google.com", "microsoft.com", "github.com"];

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of the most recent probe against one provider.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub response_time_ms: u64,
    pub test_successful: bool,
    pub status_code: u16,
    pub checked_at: DateTime<Utc>,
}

/// One provider's descriptor state plus its latest probe result.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderDetail {
    #[serde(flatten)]
    pub status: ProviderStatusView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<ProviderHealth>,
}

/// State of one auxiliary breaker scope.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerScope {
    pub name: String,
    pub state: BreakerState,
}

/// The read-only aggregate handed to the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub whois: OverallStatus,
    pub providers: Vec<ProviderDetail>,
    pub breakers: Vec<BreakerScope>,
    pub last_check_time: Option<DateTime<Utc>>,
}

struct ProbeState {
    providers: HashMap<String, ProviderHealth>,
    last_check: Option<DateTime<Utc>>,
}

pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    breakers: Vec<Arc<CircuitBreaker>>,
    interval: Duration,
    state: RwLock<ProbeState>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breakers: Vec<Arc<CircuitBreaker>>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            breakers,
            interval: Duration::from_secs(config.health_check_interval_hours * 3600),
            state: RwLock::new(ProbeState { providers: HashMap::new(), last_check: None }),
        }
    }

    /// Spawn the probe loop: one immediate cycle, then one per interval.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_hours = self.interval.as_secs() / 3600, "health probe started");
            loop {
                self.run_once().await;
                tokio::time::sleep(self.interval).await;
            }
        })
    }

    /// Probe every registered provider once, concurrently. No registry lock
    /// is held while the outbound calls are in flight; descriptors are
    /// updated only after each probe returns.
    pub async fn run_once(&self) {
        let probes = self.registry.all_providers().into_iter().map(|provider| async move {
            let canary = CANARY_DOMAINS
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or("google.com");

            debug!(provider = provider.name(), canary, "probing provider");
            let started = std::time::Instant::now();
            let outcome =
                tokio::time::timeout(PROBE_TIMEOUT, provider.query(canary, PROBE_TIMEOUT)).await;
            let response_time_ms = started.elapsed().as_millis() as u64;

            let (test_successful, status_code) = match &outcome {
                Ok(Ok(record)) => (true, record.status_code),
                Ok(Err(e)) => (false, e.status_code()),
                Err(_) => (false, crate::STATUS_TIMEOUT),
            };
            if !test_successful {
                warn!(provider = provider.name(), canary, status_code, "health probe failed");
            }

            (
                provider.name().to_string(),
                ProviderHealth {
                    response_time_ms,
                    test_successful,
                    status_code,
                    checked_at: Utc::now(),
                },
            )
        });

        let mut results = HashMap::new();
        for (provider, health) in futures::future::join_all(probes).await {
            // The probe counts like a real query
            if health.test_successful {
                self.registry.record_success(&provider).await;
            } else {
                self.registry.record_failure(&provider).await;
            }
            results.insert(provider, health);
        }

        let mut state = self.state.write().await;
        state.providers.extend(results);
        state.last_check = Some(Utc::now());
    }

    /// Current aggregate, cheap enough to serve on every health request.
    pub async fn snapshot(&self) -> HealthSnapshot {
        let statuses = self.registry.provider_statuses().await;
        let whois = self.registry.overall_status().await;

        let probe_state = self.state.read().await;
        let providers = statuses
            .into_iter()
            .map(|status| ProviderDetail {
                health: probe_state.providers.get(&status.id).cloned(),
                status,
            })
            .collect();

        let mut breakers = Vec::with_capacity(self.breakers.len());
        for breaker in &self.breakers {
            breakers
                .push(BreakerScope { name: breaker.name().to_string(), state: breaker.state().await });
        }

        HealthSnapshot { whois, providers, breakers, last_check_time: probe_state.last_check }
    }
}
