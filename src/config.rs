use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::fallback::FallbackChainConfig;
use crate::orchestrator::LoadBalancingStrategy;
use crate::resilience::{
    BackoffStrategy, CircuitBreakerConfig, RateLimiterConfig, RetryPolicy,
};
use crate::sources::resilient::ResilientSourceConfig;
use crate::sync::SyncConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub cache: CacheConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Health server port (default: 8080)
    #[serde(default)]
    pub health_port: Option<u16>,
}

/// Per-source resilience and credential settings
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub espn: SourceSettings,
    #[serde(default)]
    pub sportsdata: SourceSettings,
    #[serde(default)]
    pub nfl_official: SourceSettings,
    #[serde(default)]
    pub fantasydata: SourceSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Registration priority, lower wins
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff: String,
    #[serde(default = "default_rps")]
    pub requests_per_second: u32,
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            api_key: None,
            priority: 0,
            timeout_ms: default_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_ms(),
            backoff: default_backoff(),
            requests_per_second: default_rps(),
            requests_per_minute: default_rpm(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_secs(),
        }
    }
}

impl SourceSettings {
    pub fn resilience(&self) -> ResilientSourceConfig {
        ResilientSourceConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            retry: RetryPolicy::new(
                self.retry_attempts,
                Duration::from_millis(self.retry_base_delay_ms),
                self.backoff.parse().unwrap_or(BackoffStrategy::Exponential),
            ),
            rate_limit: RateLimiterConfig {
                requests_per_second: self.requests_per_second,
                requests_per_minute: self.requests_per_minute,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: self.failure_threshold,
                recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Extra full passes over the source set
    #[serde(default = "default_set_retries")]
    pub set_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            set_retries: default_set_retries(),
        }
    }
}

impl OrchestratorConfig {
    pub fn load_balancing(&self) -> LoadBalancingStrategy {
        self.strategy
            .parse()
            .unwrap_or(LoadBalancingStrategy::Priority)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_max_providers")]
    pub max_providers: usize,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_true")]
    pub database_enabled: bool,
    #[serde(default = "default_true")]
    pub mock_enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_providers: default_max_providers(),
            cache_enabled: true,
            database_enabled: true,
            mock_enabled: true,
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_secs(),
        }
    }
}

impl FallbackConfig {
    pub fn chain_config(&self) -> FallbackChainConfig {
        FallbackChainConfig {
            max_providers: self.max_providers,
            cache_enabled: self.cache_enabled,
            database_enabled: self.database_enabled,
            mock_enabled: self.mock_enabled,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: self.failure_threshold,
                recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_game_poll_secs")]
    pub game_poll_secs: u64,
    #[serde(default = "default_stats_poll_secs")]
    pub stats_poll_secs: u64,
    #[serde(default = "default_rebroadcast_secs")]
    pub rebroadcast_secs: u64,
    #[serde(default = "default_max_concurrent_polls")]
    pub max_concurrent_polls: usize,
    #[serde(default)]
    pub watched_players: Vec<String>,
    #[serde(default = "default_true")]
    pub write_through: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            game_poll_secs: default_game_poll_secs(),
            stats_poll_secs: default_stats_poll_secs(),
            rebroadcast_secs: default_rebroadcast_secs(),
            max_concurrent_polls: default_max_concurrent_polls(),
            watched_players: Vec::new(),
            write_through: true,
        }
    }
}

impl SyncSettings {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            game_poll_interval: Duration::from_secs(self.game_poll_secs),
            stats_poll_interval: Duration::from_secs(self.stats_poll_secs),
            rebroadcast_interval: Duration::from_secs(self.rebroadcast_secs),
            max_concurrent_polls: self.max_concurrent_polls,
            watched_players: self.watched_players.clone(),
            write_through: self.write_through,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_backoff() -> String {
    "exponential".to_string()
}
fn default_rps() -> u32 {
    5
}
fn default_rpm() -> u32 {
    100
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_secs() -> u64 {
    60
}
fn default_strategy() -> String {
    "priority".to_string()
}
fn default_set_retries() -> u32 {
    2
}
fn default_max_providers() -> usize {
    10
}
fn default_game_poll_secs() -> u64 {
    15
}
fn default_stats_poll_secs() -> u64 {
    30
}
fn default_rebroadcast_secs() -> u64 {
    5
}
fn default_max_concurrent_polls() -> usize {
    8
}
fn default_cache_entries() -> usize {
    10_000
}
fn default_max_connections() -> u32 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("GRIDFEED_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (GRIDFEED_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("GRIDFEED")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Sanity checks beyond what deserialization enforces. Returns every
    /// problem found, not just the first.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for (name, source) in [
            ("espn", &self.sources.espn),
            ("sportsdata", &self.sources.sportsdata),
            ("nfl_official", &self.sources.nfl_official),
            ("fantasydata", &self.sources.fantasydata),
        ] {
            if !source.enabled {
                continue;
            }
            if source.requests_per_second == 0 || source.requests_per_minute == 0 {
                problems.push(format!("sources.{name}: rate limit ceilings must be > 0"));
            }
            if source.failure_threshold == 0 {
                problems.push(format!("sources.{name}: failure_threshold must be > 0"));
            }
            if source.backoff.parse::<BackoffStrategy>().is_err() {
                problems.push(format!(
                    "sources.{name}: unknown backoff '{}'",
                    source.backoff
                ));
            }
        }

        for (name, source) in [
            ("sportsdata", &self.sources.sportsdata),
            ("fantasydata", &self.sources.fantasydata),
        ] {
            if source.enabled && source.api_key.is_none() {
                problems.push(format!("sources.{name}: enabled but api_key is missing"));
            }
        }

        if self
            .orchestrator
            .strategy
            .parse::<LoadBalancingStrategy>()
            .is_err()
        {
            problems.push(format!(
                "orchestrator: unknown strategy '{}'",
                self.orchestrator.strategy
            ));
        }

        if self.fallback.max_providers == 0 {
            problems.push("fallback: max_providers must be > 0".to_string());
        }
        if self.sync.game_poll_secs == 0 || self.sync.stats_poll_secs == 0 {
            problems.push("sync: poll intervals must be > 0".to_string());
        }
        if self.sync.max_concurrent_polls == 0 {
            problems.push("sync: max_concurrent_polls must be > 0".to_string());
        }

        problems
    }
}
