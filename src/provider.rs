//! Provider abstraction and the shared HTTP machinery all JSON adapters use:
//! bounded attempts, exponential backoff, response classification, and the
//! truncated-body salvage path.

use crate::{errors::QueryError, DomainRecord};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Maximum attempts per provider query, including the first.
pub(crate) const MAX_ATTEMPTS: u32 = 3;

/// Cap on any single upstream attempt; strictly shorter than the
/// per-provider budget the resolver hands out, so a stalled attempt still
/// leaves room for a retry.
pub(crate) const DEFAULT_ATTEMPT_CAP: Duration = Duration::from_secs(8);

/// Upstream protocol family a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Rdap,
    HttpJson,
    WhoisText,
}

/// One upstream source of registration data.
///
/// Adapters are stateless with respect to scheduling: usage counters and
/// enablement live in the registry, never here.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider id used for registry bookkeeping and provenance.
    fn name(&self) -> &'static str;

    fn kind(&self) -> ProviderKind;

    /// Query one domain with a bounded per-attempt deadline. Retries happen
    /// inside this call; the returned record is already normalized.
    async fn query(&self, domain: &str, attempt_timeout: Duration)
        -> Result<DomainRecord, QueryError>;
}

/// Backoff progression for in-adapter retries: `base × 1.5^attempt`,
/// tripled while the upstream is throttling us.
#[derive(Debug, Clone)]
pub(crate) struct RetryPlan {
    pub base: Duration,
}

impl Default for RetryPlan {
    fn default() -> Self {
        Self { base: Duration::from_secs(1) }
    }
}

impl RetryPlan {
    pub fn backoff(&self, attempt: u32, throttled: bool) -> Duration {
        let delay = self.base.mul_f64(1.5f64.powi(attempt as i32));
        if throttled {
            delay * 3
        } else {
            delay
        }
    }
}

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureClass {
    Transient,
    Fatal,
}

/// 401/403 are treated as transient: several upstreams shed load with them.
pub(crate) fn classify_status(status: StatusCode) -> FailureClass {
    match status.as_u16() {
        401 | 403 | 429 => FailureClass::Transient,
        s if s >= 500 => FailureClass::Transient,
        _ => FailureClass::Fatal,
    }
}

/// Replace API-key query parameters with a placeholder for logging.
pub(crate) fn masked_url(url: &Url) -> String {
    let mut masked = url.clone();
    let params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            if k.to_ascii_lowercase().contains("key") {
                (k.into_owned(), "[HIDDEN]".to_string())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();

    if params.is_empty() {
        return masked.to_string();
    }

    masked.query_pairs_mut().clear().extend_pairs(params);
    masked.to_string()
}

/// Shared HTTP plumbing for the JSON-speaking adapters.
pub(crate) struct HttpAdapter {
    pub client: Client,
    /// Used for the one-shot body salvage; carries no request timeout.
    pub salvage_client: Client,
    pub retry: RetryPlan,
    /// Some upstreams keep streaming the body long after a 200; when set,
    /// an aborted body-read triggers one direct re-request.
    pub salvage_truncated_body: bool,
    /// Bootstrap endpoints redirect to the authoritative registry; when set,
    /// 301/302 are chased by hand up to this many hops.
    pub max_redirect_hops: Option<usize>,
    /// Upper bound on one HTTP attempt, whatever budget the caller passes.
    pub attempt_cap: Duration,
    pub provider: &'static str,
}

impl HttpAdapter {
    pub fn new(provider: &'static str, manual_redirects: bool) -> Result<Self, QueryError> {
        let builder = || {
            let mut b = Client::builder()
                .user_agent(concat!("domain-intel/", env!("CARGO_PKG_VERSION")))
                .gzip(true)
                .pool_max_idle_per_host(10)
                .pool_idle_timeout(Duration::from_secs(60))
                .tcp_keepalive(Duration::from_secs(30))
                .connect_timeout(Duration::from_secs(10));
            if manual_redirects {
                b = b.redirect(reqwest::redirect::Policy::none());
            }
            b
        };

        Ok(Self {
            client: builder().build()?,
            salvage_client: builder().build()?,
            retry: RetryPlan::default(),
            salvage_truncated_body: true,
            max_redirect_hops: manual_redirects.then_some(3),
            attempt_cap: DEFAULT_ATTEMPT_CAP,
            provider,
        })
    }

    pub fn with_attempt_cap(mut self, cap: Duration) -> Self {
        self.attempt_cap = cap;
        self
    }

    #[cfg(test)]
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry = RetryPlan { base };
        self
    }

    /// GET a JSON document with the full retry policy applied.
    ///
    /// 404 is returned as [`QueryError::NotFound`] without retrying so the
    /// adapter can translate it into an availability answer.
    pub async fn get_json(
        &self,
        url: &Url,
        accept: &str,
        attempt_timeout: Duration,
    ) -> Result<serde_json::Value, QueryError> {
        self.get_json_checked(url, accept, attempt_timeout, |_| Ok(())).await
    }

    /// Like [`Self::get_json`], with a body sanity check that participates in
    /// the retry loop: upstreams occasionally return well-formed JSON with an
    /// empty domain payload, which is retried like any transient failure.
    pub async fn get_json_checked(
        &self,
        url: &Url,
        accept: &str,
        attempt_timeout: Duration,
        check: impl Fn(&serde_json::Value) -> Result<(), String>,
    ) -> Result<serde_json::Value, QueryError> {
        let mut last_error = QueryError::Internal("no attempt made".to_string());

        for attempt in 0..MAX_ATTEMPTS {
            match self.attempt_json(url, accept, attempt_timeout).await.and_then(|value| {
                check(&value)
                    .map(|_| value)
                    .map_err(|reason| (QueryError::BadPayload(reason), FailureClass::Transient))
            }) {
                Ok(value) => return Ok(value),
                Err((error, FailureClass::Fatal)) => return Err(error),
                Err((error, FailureClass::Transient)) => {
                    let throttled = matches!(&error, QueryError::RateLimited(_));
                    debug!(
                        provider = self.provider,
                        attempt = attempt + 1,
                        url = %masked_url(url),
                        "attempt failed: {}", error
                    );
                    last_error = error;

                    if attempt + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(self.retry.backoff(attempt, throttled)).await;
                    }
                }
            }
        }

        Err(last_error)
    }

    async fn attempt_json(
        &self,
        url: &Url,
        accept: &str,
        attempt_timeout: Duration,
    ) -> Result<serde_json::Value, (QueryError, FailureClass)> {
        let attempt_timeout = attempt_timeout.min(self.attempt_cap);
        let mut current = url.clone();
        let mut hops = 0usize;

        let response = loop {
            let response = self
                .client
                .get(current.clone())
                .header("Accept", accept)
                .timeout(attempt_timeout)
                .send()
                .await
                .map_err(|e| {
                    let class = if e.is_connect() || e.is_timeout() || e.is_request() {
                        FailureClass::Transient
                    } else {
                        FailureClass::Fatal
                    };
                    (QueryError::from(e), class)
                })?;

            let status = response.status();
            let redirected = matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND);

            match (redirected, self.max_redirect_hops) {
                (true, Some(limit)) => {
                    hops += 1;
                    if hops > limit {
                        return Err((QueryError::RedirectLimit(hops), FailureClass::Fatal));
                    }

                    let location = response
                        .headers()
                        .get(reqwest::header::LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .ok_or_else(|| {
                            (
                                QueryError::BadPayload("redirect without Location header".to_string()),
                                FailureClass::Fatal,
                            )
                        })?;
                    current = current.join(location).map_err(|e| {
                        (
                            QueryError::BadPayload(format!("bad redirect target: {}", e)),
                            FailureClass::Fatal,
                        )
                    })?;
                    debug!(provider = self.provider, hop = hops, target = %masked_url(&current), "following redirect");
                }
                _ => break response,
            }
        };

        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err((QueryError::NotFound, FailureClass::Fatal));
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            let message: String = message.chars().take(200).collect();
            let error = if status == StatusCode::TOO_MANY_REQUESTS {
                QueryError::RateLimited(self.provider.to_string())
            } else {
                QueryError::UpstreamStatus { status: status.as_u16(), message }
            };
            return Err((error, classify_status(status)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !content_type.contains("json") {
            return Err((
                QueryError::BadPayload(format!("unexpected content type: {}", content_type)),
                FailureClass::Fatal,
            ));
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) if self.salvage_truncated_body => {
                warn!(
                    provider = self.provider,
                    url = %masked_url(url),
                    "body read aborted after 200, salvaging with a direct request: {}", e
                );
                self.salvage_body(url, accept).await.map_err(|e| (e, FailureClass::Transient))?
            }
            Err(e) => return Err((QueryError::from(e), FailureClass::Transient)),
        };

        serde_json::from_str(&body)
            // Truncated JSON reads as a decode failure; retry the attempt
            .map_err(|e| (QueryError::BadPayload(e.to_string()), FailureClass::Transient))
    }

    async fn salvage_body(&self, url: &Url, accept: &str) -> Result<String, QueryError> {
        let response = self.salvage_client.get(url.clone()).header("Accept", accept).send().await?;
        if !response.status().is_success() {
            return Err(QueryError::UpstreamStatus {
                status: response.status().as_u16(),
                message: "salvage request failed".to_string(),
            });
        }
        Ok(response.text().await?)
    }
}
