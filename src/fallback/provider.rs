//! One named provider inside a fallback chain.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::resilience::RetryPolicy;

type FetchFn = Box<dyn Fn() -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;
type TransformFn<T> = Box<dyn Fn(serde_json::Value) -> Result<T> + Send + Sync>;
type ValidateFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// A fetch step plus optional transform and validate hooks.
///
/// Fetch produces raw JSON so providers wrapping different upstream shapes
/// can share one chain; transform turns it into the chain's typed value.
pub struct Provider<T> {
    name: String,
    priority: u32,
    enabled: AtomicBool,
    timeout: Duration,
    retry: RetryPolicy,
    fetch: FetchFn,
    transform: Option<TransformFn<T>>,
    validate: Option<ValidateFn<T>>,
}

impl<T: serde::de::DeserializeOwned> Provider<T> {
    pub fn builder(name: impl Into<String>) -> ProviderBuilder<T> {
        ProviderBuilder {
            name: name.into(),
            priority: 0,
            timeout: Duration::from_secs(10),
            retry: RetryPolicy {
                attempts: 0,
                ..RetryPolicy::default()
            },
            fetch: None,
            transform: None,
            validate: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Fetch, transform, validate, within this provider's retry budget.
    /// Any stage error fails this provider only; validation failures retry
    /// like transport errors.
    pub async fn resolve(&self) -> Result<T> {
        let max_attempts = self.retry.attempts + 1;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.retry.jittered_delay_for(attempt - 1);
                debug!(provider = %self.name, attempt, delay_ms = delay.as_millis() as u64, "provider retry");
                tokio::time::sleep(delay).await;
            }
            match self.resolve_once().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = err.is_retryable();
                    last_error = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            crate::error::FeedError::Internal(format!("provider '{}' made no attempts", self.name))
        }))
    }

    async fn resolve_once(&self) -> Result<T> {
        let raw = tokio::time::timeout(self.timeout, (self.fetch)())
            .await
            .map_err(|_| crate::error::FeedError::Timeout {
                operation: self.name.clone(),
                elapsed_ms: self.timeout.as_millis() as u64,
            })??;
        let value = match &self.transform {
            Some(transform) => transform(raw)?,
            None => serde_json::from_value(raw)?,
        };
        if let Some(validate) = &self.validate {
            if !validate(&value) {
                return Err(crate::error::FeedError::Validation(format!(
                    "provider '{}' returned data that failed validation",
                    self.name
                )));
            }
        }
        Ok(value)
    }
}

pub struct ProviderBuilder<T> {
    name: String,
    priority: u32,
    timeout: Duration,
    retry: RetryPolicy,
    fetch: Option<FetchFn>,
    transform: Option<TransformFn<T>>,
    validate: Option<ValidateFn<T>>,
}

impl<T: serde::de::DeserializeOwned> ProviderBuilder<T> {
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn fetch<F>(mut self, fetch: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync + 'static,
    {
        self.fetch = Some(Box::new(fetch));
        self
    }

    pub fn transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(serde_json::Value) -> Result<T> + Send + Sync + 'static,
    {
        self.transform = Some(Box::new(transform));
        self
    }

    pub fn validate<F>(mut self, validate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Box::new(validate));
        self
    }

    pub fn build(self) -> Result<Provider<T>> {
        let fetch = self.fetch.ok_or_else(|| {
            crate::error::FeedError::ProviderRegistry(format!(
                "provider '{}' has no fetch function",
                self.name
            ))
        })?;
        Ok(Provider {
            name: self.name,
            priority: self.priority,
            enabled: AtomicBool::new(true),
            timeout: self.timeout,
            retry: self.retry,
            fetch,
            transform: self.transform,
            validate: self.validate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fetch_ok(value: serde_json::Value) -> impl Fn() -> BoxFuture<'static, Result<serde_json::Value>> {
        move || {
            let value = value.clone();
            Box::pin(async move { Ok(value) })
        }
    }

    #[tokio::test]
    async fn resolves_with_default_deserialization() {
        let provider: Provider<u32> = Provider::builder("p")
            .fetch(fetch_ok(json!(7)))
            .build()
            .unwrap();
        assert_eq!(provider.resolve().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn transform_overrides_deserialization() {
        let provider: Provider<u32> = Provider::builder("p")
            .fetch(fetch_ok(json!({"week": 6})))
            .transform(|raw| {
                raw.get("week")
                    .and_then(|w| w.as_u64())
                    .map(|w| w as u32)
                    .ok_or_else(|| crate::error::FeedError::Validation("no week".to_string()))
            })
            .build()
            .unwrap();
        assert_eq!(provider.resolve().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn failed_validation_is_an_error() {
        let provider: Provider<u32> = Provider::builder("p")
            .fetch(fetch_ok(json!(99)))
            .validate(|v| *v <= 18)
            .build()
            .unwrap();
        assert!(matches!(
            provider.resolve().await,
            Err(crate::error::FeedError::Validation(_))
        ));
    }

    #[test]
    fn builder_requires_fetch() {
        let result: Result<Provider<u32>> = Provider::builder("p").build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn retry_budget_covers_transient_fetch_errors() {
        use std::sync::atomic::AtomicU32;
        use std::sync::Arc;

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let provider: Provider<u32> = Provider::builder("p")
            .retry(crate::resilience::RetryPolicy::new(
                2,
                Duration::from_millis(1),
                crate::resilience::BackoffStrategy::Fixed,
            ))
            .fetch(move || {
                let calls = Arc::clone(&calls_clone);
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(crate::error::FeedError::Validation("flaky".to_string()))
                    } else {
                        Ok(json!(3))
                    }
                })
            })
            .build()
            .unwrap();

        assert_eq!(provider.resolve().await.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
