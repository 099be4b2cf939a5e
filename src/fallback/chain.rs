use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::provider::Provider;
use crate::cache::{CacheManager, Namespace};
use crate::error::{FeedError, Result};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

type StoreFn<T> = Box<dyn Fn(String) -> BoxFuture<'static, Result<Option<T>>> + Send + Sync>;
type SynthesizeFn<T> = Box<dyn Fn() -> T + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FallbackChainConfig {
    pub max_providers: usize,
    pub cache_enabled: bool,
    pub database_enabled: bool,
    pub mock_enabled: bool,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for FallbackChainConfig {
    fn default() -> Self {
        Self {
            max_providers: 10,
            cache_enabled: true,
            database_enabled: true,
            mock_enabled: true,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// One provider's failure during a chain invocation
#[derive(Debug, Clone, Serialize)]
pub struct ProviderError {
    pub provider: String,
    pub message: String,
    pub latency_ms: u64,
}

/// A resolved value plus which tier produced it
#[derive(Debug, Clone)]
pub struct FallbackResult<T> {
    pub data: T,
    pub from_cache: bool,
    pub from_database: bool,
    pub from_mock_data: bool,
    /// Name of the provider that answered, when tier 2 won
    pub successful_provider: Option<String>,
    pub providers_attempted: usize,
    /// Failures collected before the winning tier answered
    pub errors: Vec<ProviderError>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChainMetrics {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub provider_successes: u64,
    pub database_hits: u64,
    pub mock_hits: u64,
    pub total_failures: u64,
}

/// Admin view of one registered provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub priority: u32,
    pub enabled: bool,
    pub circuit_state: CircuitState,
}

/// Strict-tier fallback for one operation: cache, providers, store, default.
pub struct FallbackChain<T> {
    operation: String,
    config: FallbackChainConfig,
    providers: RwLock<Vec<Arc<Provider<T>>>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    cache: Option<Arc<CacheManager>>,
    cache_namespace: Namespace,
    store_lookup: Option<StoreFn<T>>,
    synthesize: Option<SynthesizeFn<T>>,
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    provider_successes: AtomicU64,
    database_hits: AtomicU64,
    mock_hits: AtomicU64,
    total_failures: AtomicU64,
}

impl<T> FallbackChain<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(operation: impl Into<String>, config: FallbackChainConfig) -> Self {
        Self {
            operation: operation.into(),
            config,
            providers: RwLock::new(Vec::new()),
            breakers: RwLock::new(HashMap::new()),
            cache: None,
            cache_namespace: Namespace::Games,
            store_lookup: None,
            synthesize: None,
            total_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            provider_successes: AtomicU64::new(0),
            database_hits: AtomicU64::new(0),
            mock_hits: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheManager>, namespace: Namespace) -> Self {
        self.cache = Some(cache);
        self.cache_namespace = namespace;
        self
    }

    pub fn with_store_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(String) -> BoxFuture<'static, Result<Option<T>>> + Send + Sync + 'static,
    {
        self.store_lookup = Some(Box::new(lookup));
        self
    }

    pub fn with_synthesized_default<F>(mut self, synthesize: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.synthesize = Some(Box::new(synthesize));
        self
    }

    /// Register a provider. Rejects duplicates by name and enforces the
    /// provider cap; each provider gets its own breaker keyed by name.
    pub fn add_provider(&self, provider: Provider<T>) -> Result<()> {
        let mut providers = self.providers.write().expect("provider lock poisoned");
        if providers.len() >= self.config.max_providers {
            return Err(FeedError::ProviderRegistry(format!(
                "chain '{}' is at its provider cap ({})",
                self.operation, self.config.max_providers
            )));
        }
        if providers.iter().any(|p| p.name() == provider.name()) {
            return Err(FeedError::ProviderRegistry(format!(
                "chain '{}' already has a provider named '{}'",
                self.operation,
                provider.name()
            )));
        }

        self.breakers
            .write()
            .expect("breaker lock poisoned")
            .insert(
                provider.name().to_string(),
                Arc::new(CircuitBreaker::new(
                    format!("{}:{}", self.operation, provider.name()),
                    self.config.circuit_breaker.clone(),
                )),
            );
        providers.push(Arc::new(provider));
        providers.sort_by_key(|p| p.priority());
        Ok(())
    }

    pub fn remove_provider(&self, name: &str) -> bool {
        let mut providers = self.providers.write().expect("provider lock poisoned");
        let before = providers.len();
        providers.retain(|p| p.name() != name);
        let removed = providers.len() < before;
        if removed {
            self.breakers
                .write()
                .expect("breaker lock poisoned")
                .remove(name);
        }
        removed
    }

    pub fn toggle_provider(&self, name: &str, enabled: bool) -> bool {
        let providers = self.providers.read().expect("provider lock poisoned");
        match providers.iter().find(|p| p.name() == name) {
            Some(provider) => {
                provider.set_enabled(enabled);
                info!(chain = %self.operation, provider = name, enabled, "provider toggled");
                true
            }
            None => false,
        }
    }

    pub fn reset_circuit_breaker(&self, name: &str) -> bool {
        let breakers = self.breakers.read().expect("breaker lock poisoned");
        match breakers.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        let providers = self.providers.read().expect("provider lock poisoned");
        let breakers = self.breakers.read().expect("breaker lock poisoned");
        providers
            .iter()
            .map(|p| ProviderStatus {
                name: p.name().to_string(),
                priority: p.priority(),
                enabled: p.is_enabled(),
                circuit_state: breakers
                    .get(p.name())
                    .map(|b| b.state())
                    .unwrap_or(CircuitState::Closed),
            })
            .collect()
    }

    pub fn metrics(&self) -> ChainMetrics {
        ChainMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            provider_successes: self.provider_successes.load(Ordering::Relaxed),
            database_hits: self.database_hits.load(Ordering::Relaxed),
            mock_hits: self.mock_hits.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }

    /// Resolve one value through the tiers. `cache_key` also keys the store
    /// lookup so tiers 1 and 3 answer the same question.
    pub async fn execute(&self, cache_key: &str) -> Result<FallbackResult<T>> {
        let started = Instant::now();
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        // Tier 1: cache
        if self.config.cache_enabled {
            if let Some(cache) = &self.cache {
                if let Some(data) = cache.get::<T>(self.cache_namespace, cache_key) {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(chain = %self.operation, cache_key, "served from cache");
                    return Ok(FallbackResult {
                        data,
                        from_cache: true,
                        from_database: false,
                        from_mock_data: false,
                        successful_provider: None,
                        providers_attempted: 0,
                        errors: Vec::new(),
                        elapsed: started.elapsed(),
                    });
                }
            }
        }

        // Tier 2: providers in priority order
        let providers: Vec<Arc<Provider<T>>> = self
            .providers
            .read()
            .expect("provider lock poisoned")
            .iter()
            .filter(|p| p.is_enabled())
            .cloned()
            .collect();

        let mut attempted = 0usize;
        let mut errors: Vec<ProviderError> = Vec::new();

        for provider in &providers {
            let breaker = self
                .breakers
                .read()
                .expect("breaker lock poisoned")
                .get(provider.name())
                .cloned();
            if let Some(breaker) = &breaker {
                if breaker.try_acquire().is_err() {
                    debug!(
                        chain = %self.operation,
                        provider = provider.name(),
                        "provider skipped, breaker open"
                    );
                    continue;
                }
            }

            attempted += 1;
            let provider_started = Instant::now();
            match provider.resolve().await {
                Ok(data) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_success();
                    }
                    self.provider_successes.fetch_add(1, Ordering::Relaxed);
                    self.write_back(cache_key, &data);
                    return Ok(FallbackResult {
                        data,
                        from_cache: false,
                        from_database: false,
                        from_mock_data: false,
                        successful_provider: Some(provider.name().to_string()),
                        providers_attempted: attempted,
                        errors,
                        elapsed: started.elapsed(),
                    });
                }
                Err(err) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_failure();
                    }
                    warn!(
                        chain = %self.operation,
                        provider = provider.name(),
                        error = %err,
                        "provider failed"
                    );
                    errors.push(ProviderError {
                        provider: provider.name().to_string(),
                        message: err.to_string(),
                        latency_ms: provider_started.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        // Tier 3: persisted store
        if self.config.database_enabled {
            if let Some(lookup) = &self.store_lookup {
                match lookup(cache_key.to_string()).await {
                    Ok(Some(data)) => {
                        self.database_hits.fetch_add(1, Ordering::Relaxed);
                        self.write_back(cache_key, &data);
                        info!(chain = %self.operation, cache_key, "served from store");
                        return Ok(FallbackResult {
                            data,
                            from_cache: false,
                            from_database: true,
                            from_mock_data: false,
                            successful_provider: None,
                            providers_attempted: attempted,
                            errors,
                            elapsed: started.elapsed(),
                        });
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(chain = %self.operation, error = %err, "store lookup failed");
                        errors.push(ProviderError {
                            provider: "store".to_string(),
                            message: err.to_string(),
                            latency_ms: 0,
                        });
                    }
                }
            }
        }

        // Tier 4: synthesized default
        if self.config.mock_enabled {
            if let Some(synthesize) = &self.synthesize {
                self.mock_hits.fetch_add(1, Ordering::Relaxed);
                warn!(chain = %self.operation, cache_key, "serving synthesized default");
                return Ok(FallbackResult {
                    data: synthesize(),
                    from_cache: false,
                    from_database: false,
                    from_mock_data: true,
                    successful_provider: None,
                    providers_attempted: attempted,
                    errors,
                    elapsed: started.elapsed(),
                });
            }
        }

        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let failures = if errors.is_empty() {
            vec!["no tier produced data".to_string()]
        } else {
            errors
                .iter()
                .map(|e| format!("{}: {}", e.provider, e.message))
                .collect()
        };
        Err(FeedError::TotalFailure {
            operation: self.operation.clone(),
            providers_attempted: attempted,
            failures,
        })
    }

    fn write_back(&self, cache_key: &str, data: &T) {
        if !self.config.cache_enabled {
            return;
        }
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.set(self.cache_namespace, cache_key, data) {
                warn!(chain = %self.operation, error = %err, "cache write-back failed");
            }
        }
    }
}
