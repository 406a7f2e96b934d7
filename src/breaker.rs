//! Three-state circuit breaker for auxiliary upstream scopes.
//!
//! WHOIS providers are not wrapped in one of these: the registry's
//! consecutive-error cooldown already encodes the equivalent policy. The
//! breakers protect the side services (screenshot rendering, itdog
//! connectivity probes) whose callers need an immediate reject instead of a
//! queue of doomed requests.

use crate::errors::QueryError;
use std::{
    future::Future,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Core {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

type TransitionHook = Box<dyn Fn(&str, BreakerState) + Send + Sync>;

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    core: RwLock<Core>,
    on_transition: Option<TransitionHook>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            core: RwLock::new(Core {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
            on_transition: None,
        }
    }

    /// Breaker guarding the screenshot renderer pool.
    pub fn screenshot() -> Self {
        Self::new("screenshot", 5, Duration::from_secs(60))
    }

    /// Breaker guarding the itdog connectivity-probe upstream.
    pub fn itdog() -> Self {
        Self::new("itdog", 8, Duration::from_secs(120))
    }

    /// Install a hook invoked on every state change, outside the lock.
    pub fn with_transition_hook(
        mut self,
        hook: impl Fn(&str, BreakerState) + Send + Sync + 'static,
    ) -> Self {
        self.on_transition = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> BreakerState {
        self.core.read().await.state
    }

    /// Whether a request may proceed right now. An Open breaker whose reset
    /// window elapsed flips to HalfOpen here and admits exactly one probe.
    pub async fn allow(&self) -> bool {
        {
            let core = self.core.read().await;
            match core.state {
                BreakerState::Closed => return true,
                // The single probe is already in flight
                BreakerState::HalfOpen => return false,
                BreakerState::Open => {
                    let reset_due = core
                        .last_failure
                        .map_or(true, |t| t.elapsed() >= self.reset_timeout);
                    if !reset_due {
                        return false;
                    }
                }
            }
        }

        // Upgrade to the write lock for the Open -> HalfOpen transition;
        // re-check because another task may have raced us here.
        let transition = {
            let mut core = self.core.write().await;
            match core.state {
                BreakerState::Closed => return true,
                BreakerState::HalfOpen => return false,
                BreakerState::Open => {
                    let reset_due = core
                        .last_failure
                        .map_or(true, |t| t.elapsed() >= self.reset_timeout);
                    if !reset_due {
                        return false;
                    }
                    core.state = BreakerState::HalfOpen;
                    core.probe_in_flight = true;
                    BreakerState::HalfOpen
                }
            }
        };

        self.fire(transition);
        true
    }

    /// Record the outcome of a call that was admitted by [`Self::allow`].
    pub async fn record(&self, success: bool) {
        let transition = {
            let mut core = self.core.write().await;
            match (core.state, success) {
                (BreakerState::Closed, true) => {
                    // Consecutive, not cumulative
                    core.failures = 0;
                    None
                }
                (BreakerState::Closed, false) => {
                    core.failures += 1;
                    core.last_failure = Some(Instant::now());
                    if core.failures >= self.failure_threshold {
                        core.state = BreakerState::Open;
                        Some(BreakerState::Open)
                    } else {
                        None
                    }
                }
                (BreakerState::HalfOpen, true) => {
                    core.state = BreakerState::Closed;
                    core.failures = 0;
                    core.probe_in_flight = false;
                    Some(BreakerState::Closed)
                }
                (BreakerState::HalfOpen, false) => {
                    core.state = BreakerState::Open;
                    core.last_failure = Some(Instant::now());
                    core.probe_in_flight = false;
                    Some(BreakerState::Open)
                }
                // A straggler reporting after the state already moved on
                (BreakerState::Open, _) => None,
            }
        };

        if let Some(transition) = transition {
            self.fire(transition);
        }
    }

    /// Convenience wrapper: `allow`, run the operation, `record`.
    pub async fn execute<T, Fut>(&self, op: impl FnOnce() -> Fut) -> Result<T, QueryError>
    where
        Fut: Future<Output = Result<T, QueryError>>,
    {
        if !self.allow().await {
            return Err(QueryError::CircuitOpen(self.name.clone()));
        }

        let result = op().await;
        self.record(result.is_ok()).await;
        result
    }

    fn fire(&self, state: BreakerState) {
        info!(breaker = %self.name, ?state, "circuit breaker state change");
        if let Some(hook) = &self.on_transition {
            hook(&self.name, state);
        }
    }
}
