use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use domain_intel::{
    breaker::CircuitBreaker,
    health::HealthMonitor,
    limiter::{RateLimitPolicy, SlidingWindowLimiter},
    metrics,
    pool::WorkerPool,
    Config, DomainIntelClient, QueryError, Resolution, Resolver, STATUS_NOT_FOUND, STATUS_OK,
    STATUS_OK_CACHE,
};

#[derive(Clone)]
struct AppState {
    resolver: Arc<Resolver>,
    limiter: Option<SlidingWindowLimiter>,
    api_policy: RateLimitPolicy,
    pool: WorkerPool,
    health: Arc<HealthMonitor>,
}

#[derive(Deserialize)]
struct WhoisQuery {
    domain: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "domain_intel=info,tower_http=debug".into()),
        )
        .init();

    // Load configuration
    let config = Arc::new(Config::load()?);
    info!("Configuration loaded successfully");

    // Initialize services
    let client = DomainIntelClient::new(config.clone()).await?;
    let resolver = client.resolver();

    let limiter = match SlidingWindowLimiter::connect(&config.redis_url).await {
        Ok(limiter) => Some(limiter),
        Err(e) => {
            warn!("Rate limiter unavailable, admitting all traffic: {}", e);
            None
        }
    };

    // Breakers for the auxiliary upstream scopes; surfaced via /api/health
    let breakers =
        vec![Arc::new(CircuitBreaker::screenshot()), Arc::new(CircuitBreaker::itdog())];

    let health = Arc::new(HealthMonitor::new(resolver.registry().clone(), breakers, &config));
    health.clone().spawn();

    // Initialize metrics
    metrics::init_metrics();

    let app_state = AppState {
        resolver,
        limiter,
        api_policy: RateLimitPolicy::api(config.api_rate_limit_per_minute),
        pool: WorkerPool::new(config.worker_pool_size),
        health,
    };

    // Build the application
    let app = Router::new()
        .route("/api/v1/whois", get(whois_lookup))
        .route("/api/v1/whois/:domain", get(whois_lookup_path))
        .route("/api/health", get(health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(app_state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive())
                .into_inner(),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!("Domain intel service listening on {}", addr);
    info!("Health check: http://{}/api/health", addr);
    info!("Metrics: http://{}/metrics", addr);

    // Graceful shutdown handling
    let shutdown_signal = async {
        tokio::signal::ctrl_c().await.expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal, gracefully shutting down...");
    };

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}

async fn whois_lookup(
    Query(params): Query<WhoisQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let Some(domain) = params.domain.filter(|d| !d.trim().is_empty()) else {
        metrics::increment_errors("missing_parameter");
        return QueryError::MissingParameter("domain").into_response();
    };

    lookup(state, domain, headers, addr).await
}

async fn whois_lookup_path(
    Path(domain): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    lookup(state, domain, headers, addr).await
}

async fn lookup(state: AppState, domain: String, headers: HeaderMap, addr: SocketAddr) -> Response {
    let start_time = std::time::Instant::now();
    let client = client_ip(&headers, addr);

    // Rate limit before any work is admitted
    if let Some(limiter) = &state.limiter {
        match limiter.allow(&state.api_policy, &client).await {
            Ok(true) => {}
            Ok(false) => {
                metrics::increment_rate_limited();
                return failure_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMITED",
                    "too many requests, slow down",
                );
            }
            Err(e) => {
                // Redis being down should shed protection, not traffic
                warn!("Rate limiter check failed for {}: {}", client, e);
            }
        }
    }

    // Admission into the worker pool; a full pool rejects immediately
    let Some(_permit) = state.pool.try_acquire() else {
        metrics::increment_pool_rejections();
        return QueryError::ServiceBusy.into_response();
    };

    let resolution = state.resolver.resolve(&domain).await;
    let processing_ms = start_time.elapsed().as_millis() as u64;

    if resolution.from_cache {
        metrics::increment_cache_hits();
    } else {
        metrics::increment_cache_misses();
    }
    metrics::record_query(&resolution.record.source_provider, outcome_label(&resolution));
    metrics::record_query_time(processing_ms);

    resolution_response(resolution, processing_ms)
}

async fn health_check(State(state): State<AppState>) -> Response {
    let snapshot = state.health.snapshot().await;
    metrics::set_providers_enabled(snapshot.whois.available);
    Json(snapshot).into_response()
}

/// Map a resolution onto the unified JSON envelope. Cache hits carry the
/// internal 201 status and are downgraded to HTTP 200 with `cached:true`.
fn resolution_response(resolution: Resolution, processing_ms: u64) -> Response {
    let record = &resolution.record;
    let succeeded = matches!(record.status_code, STATUS_OK | STATUS_OK_CACHE)
        || (record.available && record.status_code == STATUS_NOT_FOUND);

    if succeeded {
        let mut meta = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "processingTimeMs": processing_ms,
        });
        if record.status_code == STATUS_OK_CACHE {
            meta["cached"] = json!(true);
            if let Some(cached_at) = &record.cached_at {
                meta["cachedAt"] = json!(cached_at);
            }
        }

        let body = json!({
            "success": true,
            "data": record,
            "meta": meta,
        });
        return (StatusCode::OK, Json(body)).into_response();
    }

    let status =
        StatusCode::from_u16(record.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    metrics::increment_errors(domain_intel::errors::error_code_for_status(record.status_code));
    failure_response(
        status,
        domain_intel::errors::error_code_for_status(record.status_code),
        &record.status_message,
    )
}

fn failure_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = json!({
        "success": false,
        "error": { "code": code, "message": message },
        "meta": { "timestamp": chrono::Utc::now().to_rfc3339() },
    });
    (status, Json(body)).into_response()
}

fn outcome_label(resolution: &Resolution) -> &'static str {
    if resolution.from_cache {
        "cache"
    } else if matches!(resolution.record.status_code, STATUS_OK | STATUS_OK_CACHE) {
        "success"
    } else {
        "failure"
    }
}

/// Client identity for rate limiting: the first hop in X-Forwarded-For when
/// present (the service usually sits behind a proxy), the socket peer
/// otherwise.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}
