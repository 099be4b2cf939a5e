pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod fallback;
pub mod orchestrator;
pub mod resilience;
pub mod service;
pub mod services;
pub mod sources;
pub mod store;
pub mod sync;

pub use cache::{CacheManager, Namespace};
pub use config::AppConfig;
pub use error::{FeedError, Result};
pub use fallback::{FallbackChain, FallbackChainConfig, FallbackResult, Provider};
pub use orchestrator::{LoadBalancingStrategy, SourceOrchestrator};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimiter, RateLimiterConfig,
    RetryPolicy,
};
pub use service::NflDataService;
pub use services::{HealthServer, HealthState, Metrics};
pub use sources::{
    EspnClient, FantasyDataClient, NflOfficialClient, SourceClient, SportsDataClient,
};
pub use store::PostgresStore;
pub use sync::{SyncConfig, SyncEvent, SyncService};
