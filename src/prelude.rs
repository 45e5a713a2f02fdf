//! Convenient re-exports for common faultguard types.
pub use crate::{
    backoff::Backoff,
    bulkhead::BulkheadConfig,
    circuit_breaker::{CircuitBreakerConfig, CircuitState},
    error::{ErrorKind, ResilienceError},
    fallback::FallbackConfig,
    guard::{Guard, GuardBuilder},
    jitter::Jitter,
    matcher::ErrorMatcher,
    rate_limit::{RateLimitConfig, RateLimitType},
    retry::RetryConfig,
    service::GuardLayer,
    strategy::Strategy,
    timeout::TimeoutPolicy,
};
