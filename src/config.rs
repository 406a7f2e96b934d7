use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Runtime configuration for the service and library.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,

    /// Cap on a single upstream attempt inside a provider adapter; clamps
    /// whatever per-provider budget the resolver hands out.
    pub attempt_timeout_seconds: u64,
    /// Overall resolve deadline for ordinary domains.
    pub resolve_timeout_seconds: u64,
    /// Overall resolve deadline for domains on the slow list.
    pub slow_resolve_timeout_seconds: u64,
    /// Per-attempt deadline granted to the primary provider.
    pub primary_timeout_seconds: u64,
    /// Per-attempt deadline granted to the primary for slow domains.
    pub slow_primary_timeout_seconds: u64,
    /// Domains known to answer slowly at their registries.
    pub slow_domains: Vec<String>,

    pub max_referrals: usize,
    pub max_response_size: usize,
    pub concurrent_whois_queries: usize,

    /// Provider health probe interval; floored at one day.
    pub health_check_interval_hours: u64,

    pub api_rate_limit_per_minute: u64,
    pub token_rate_limit_per_minute: u64,
    pub worker_pool_size: usize,

    pub whoisfreaks_api_key: Option<String>,
    pub whoisxml_api_key: Option<String>,

    pub start_time: Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigData {
    pub port: u16,
    pub redis_url: String,
    pub attempt_timeout_seconds: u64,
    pub resolve_timeout_seconds: u64,
    pub slow_resolve_timeout_seconds: u64,
    pub primary_timeout_seconds: u64,
    pub slow_primary_timeout_seconds: u64,
    pub slow_domains: Vec<String>,
    pub max_referrals: usize,
    pub max_response_size: usize,
    pub concurrent_whois_queries: usize,
    pub health_check_interval_hours: u64,
    pub api_rate_limit_per_minute: u64,
    pub token_rate_limit_per_minute: u64,
    pub worker_pool_size: usize,
    #[serde(default)]
    pub whoisfreaks_api_key: Option<String>,
    #[serde(default)]
    pub whoisxml_api_key: Option<String>,
}

// Registries observed to stream responses slowly for these domains
const DEFAULT_SLOW_DOMAINS: [&str; 5] =
    ["byd.com", "outlook.com", "microsoft.com", "alibaba.com", "tencent.com"];

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let cpu_cores = Self::get_cpu_cores();
        let is_production = Self::is_production_environment();

        let mut settings = config::Config::builder()
            .set_default("port", Self::get_default_port())?
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("attempt_timeout_seconds", 8)?
            .set_default("resolve_timeout_seconds", 15)?
            .set_default("slow_resolve_timeout_seconds", 30)?
            .set_default("primary_timeout_seconds", 10)?
            .set_default("slow_primary_timeout_seconds", 20)?
            .set_default(
                "slow_domains",
                DEFAULT_SLOW_DOMAINS.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
            )?
            .set_default("max_referrals", if is_production { 5 } else { 3 })?
            .set_default("max_response_size", 1024 * 1024)?
            .set_default("concurrent_whois_queries", cpu_cores.min(8) as i64)?
            .set_default("health_check_interval_hours", 24)?
            .set_default("api_rate_limit_per_minute", 60)?
            .set_default("token_rate_limit_per_minute", 30)?
            .set_default("worker_pool_size", (cpu_cores * 2) as i64)?;

        // Override with environment variables if present
        settings = Self::apply_env_overrides(settings)?;

        let config_data: ConfigData = settings.build()?.try_deserialize()?;

        Ok(Self::from_data(config_data))
    }

    fn from_data(data: ConfigData) -> Self {
        Config {
            port: data.port,
            redis_url: data.redis_url,
            attempt_timeout_seconds: data.attempt_timeout_seconds,
            resolve_timeout_seconds: data.resolve_timeout_seconds,
            slow_resolve_timeout_seconds: data.slow_resolve_timeout_seconds,
            primary_timeout_seconds: data.primary_timeout_seconds,
            slow_primary_timeout_seconds: data.slow_primary_timeout_seconds,
            slow_domains: data.slow_domains,
            max_referrals: data.max_referrals,
            max_response_size: data.max_response_size,
            concurrent_whois_queries: data.concurrent_whois_queries,
            // The probe exercises real upstreams; anything more frequent than
            // daily pollutes provider usage statistics.
            health_check_interval_hours: data.health_check_interval_hours.max(24),
            api_rate_limit_per_minute: data.api_rate_limit_per_minute,
            token_rate_limit_per_minute: data.token_rate_limit_per_minute,
            worker_pool_size: data.worker_pool_size.max(1),
            whoisfreaks_api_key: data.whoisfreaks_api_key.filter(|k| !k.is_empty()),
            whoisxml_api_key: data.whoisxml_api_key.filter(|k| !k.is_empty()),
            start_time: Instant::now(),
        }
    }

    /// Whether this domain is on the slow list (matched on the sanitized form).
    pub fn is_slow_domain(&self, domain: &str) -> bool {
        self.slow_domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }

    fn get_cpu_cores() -> usize {
        std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
    }

    fn is_production_environment() -> bool {
        std::env::var("ENVIRONMENT")
            .or_else(|_| std::env::var("ENV"))
            .map(|env| env.to_lowercase() == "production" || env.to_lowercase() == "prod")
            .unwrap_or(false)
    }

    fn get_default_port() -> u16 {
        std::env::var("PORT")
            .or_else(|_| std::env::var("HTTP_PORT"))
            .or_else(|_| std::env::var("SERVER_PORT"))
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000)
    }

    fn apply_env_overrides(
        mut settings: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        let env_mappings = [
            ("PORT", "port"),
            ("REDIS_URL", "redis_url"),
            ("ATTEMPT_TIMEOUT_SECONDS", "attempt_timeout_seconds"),
            ("RESOLVE_TIMEOUT_SECONDS", "resolve_timeout_seconds"),
            ("SLOW_RESOLVE_TIMEOUT_SECONDS", "slow_resolve_timeout_seconds"),
            ("PRIMARY_TIMEOUT_SECONDS", "primary_timeout_seconds"),
            ("SLOW_PRIMARY_TIMEOUT_SECONDS", "slow_primary_timeout_seconds"),
            ("MAX_REFERRALS", "max_referrals"),
            ("MAX_RESPONSE_SIZE", "max_response_size"),
            ("CONCURRENT_WHOIS_QUERIES", "concurrent_whois_queries"),
            ("HEALTH_CHECK_INTERVAL_HOURS", "health_check_interval_hours"),
            ("API_RATE_LIMIT_PER_MINUTE", "api_rate_limit_per_minute"),
            ("TOKEN_RATE_LIMIT_PER_MINUTE", "token_rate_limit_per_minute"),
            ("WORKER_POOL_SIZE", "worker_pool_size"),
            ("WHOISFREAKS_API_KEY", "whoisfreaks_api_key"),
            ("WHOISXML_API_KEY", "whoisxml_api_key"),
        ];

        for (env_var, config_key) in env_mappings {
            if let Ok(value) = std::env::var(env_var) {
                settings = settings.set_override(config_key, value)?;
            }
        }

        // Comma-separated list override
        if let Ok(value) = std::env::var("SLOW_DOMAINS") {
            let domains: Vec<String> =
                value.split(',').map(|d| d.trim().to_lowercase()).filter(|d| !d.is_empty()).collect();
            settings = settings.set_override("slow_domains", domains)?;
        }

        Ok(settings)
    }
}

impl Default for Config {
    /// Documented defaults without touching the environment; used by tests
    /// and embedders that configure programmatically.
    fn default() -> Self {
        Self::from_data(ConfigData {
            port: 3000,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            attempt_timeout_seconds: 8,
            resolve_timeout_seconds: 15,
            slow_resolve_timeout_seconds: 30,
            primary_timeout_seconds: 10,
            slow_primary_timeout_seconds: 20,
            slow_domains: DEFAULT_SLOW_DOMAINS.iter().map(|d| d.to_string()).collect(),
            max_referrals: 3,
            max_response_size: 1024 * 1024,
            concurrent_whois_queries: 8,
            health_check_interval_hours: 24,
            api_rate_limit_per_minute: 60,
            token_rate_limit_per_minute: 30,
            worker_pool_size: Self::get_cpu_cores() * 2,
            whoisfreaks_api_key: None,
            whoisxml_api_key: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.resolve_timeout_seconds, 15);
        assert_eq!(config.slow_resolve_timeout_seconds, 30);
        assert_eq!(config.api_rate_limit_per_minute, 60);
        assert_eq!(config.token_rate_limit_per_minute, 30);
        assert!(config.slow_domains.contains(&"microsoft.com".to_string()));
    }

    #[test]
    fn test_slow_domain_matching_is_case_insensitive() {
        let config = Config::default();
        assert!(config.is_slow_domain("microsoft.com"));
        assert!(config.is_slow_domain("Microsoft.COM"));
        assert!(!config.is_slow_domain("example.com"));
    }

    #[test]
    fn test_health_interval_floored_at_one_day() {
        let data = ConfigData {
            port: 3000,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            attempt_timeout_seconds: 8,
            resolve_timeout_seconds: 15,
            slow_resolve_timeout_seconds: 30,
            primary_timeout_seconds: 10,
            slow_primary_timeout_seconds: 20,
            slow_domains: vec![],
            max_referrals: 3,
            max_response_size: 1024,
            concurrent_whois_queries: 4,
            health_check_interval_hours: 1,
            api_rate_limit_per_minute: 60,
            token_rate_limit_per_minute: 30,
            worker_pool_size: 4,
            whoisfreaks_api_key: Some(String::new()),
            whoisxml_api_key: None,
        };
        let config = Config::from_data(data);
        assert_eq!(config.health_check_interval_hours, 24);
        // Blank keys are treated as absent
        assert!(config.whoisfreaks_api_key.is_none());
    }
}
