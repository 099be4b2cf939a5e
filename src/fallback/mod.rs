//! Typed fallback chains.
//!
//! Each chain answers one operation through strict tiers: cache, then named
//! providers in priority order (each behind its own circuit breaker), then
//! the persisted store, then a synthesized default. Only exhaustion of every
//! tier is a hard failure.

mod chain;
mod provider;

pub mod defaults;

pub use chain::{
    ChainMetrics, FallbackChain, FallbackChainConfig, FallbackResult, ProviderError,
    ProviderStatus,
};
pub use provider::{Provider, ProviderBuilder};
