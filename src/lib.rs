#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # faultguard
//!
//! Composable resilience strategies for async Rust: retry, circuit breaker, bulkhead, timeout,
//! rate limiting and fallback, chained around a guarded call.
//!
//! ## Features
//!
//! - **Retry** with constant, exponential, fibonacci or custom backoff, bounded jitter, a max
//!   retry count and a max total duration
//! - **Circuit breaker** driven by a rolling outcome window, with lazy half-open probing
//! - **Bulkhead** limiting concurrency, with an optional FIFO wait queue
//! - **Timeout** racing the call against a deadline and signalling cancellation
//! - **Rate limiter** with fixed, rolling and smooth windows plus minimum spacing
//! - **Fallback** replacing selected failures with a computed value
//! - **Async bridge** so the same chain guards futures, oneshot receivers, join handles and
//!   single-value streams
//! - **tower** layer for guarding any `Service`
//!
//! Every strategy implements [`Strategy`] and wraps one delegate. Strategies sharing an
//! invocation talk through its [`InvocationContext`]: a timeout fires `TIMEOUT`, a dropped call
//! fires `CANCEL`, and whoever owns the running work (see [`Offload`]) aborts it.
//!
//! ## Quick Start
//!
//! ```rust
//! use faultguard::{Backoff, CircuitBreakerConfig, Guard, RetryConfig, TimeoutPolicy};
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let guard = Guard::<u32>::builder()
//!         .retry(
//!             RetryConfig::builder()
//!                 .max_retries(3)
//!                 .backoff(Backoff::exponential(Duration::from_millis(10)))
//!                 .build()
//!                 .unwrap(),
//!         )
//!         .circuit_breaker(CircuitBreakerConfig::builder().build().unwrap())
//!         .timeout(TimeoutPolicy::new(Duration::from_secs(1)).unwrap())
//!         .build();
//!
//!     let value = guard.call(|| async { Ok::<_, std::io::Error>(42) }).await.unwrap();
//!     assert_eq!(value, 42);
//! }
//! ```

pub mod async_types;
pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod context;
pub mod error;
pub mod fallback;
pub mod guard;
pub mod jitter;
pub mod matcher;
pub mod offload;
pub mod prelude;
pub mod rate_limit;
pub mod retry;
pub mod service;
pub mod sleeper;
pub mod strategy;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use async_types::{AsyncConverter, AsyncTypes, DeferredSupplier, NoRuntime, UnknownAsyncType};
pub use backoff::{Backoff, BackoffError, CustomBackoff};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadConfigError};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigError, CircuitBreakerHandle,
    CircuitBreakerListener, CircuitState,
};
pub use circuit_breaker_registry::{
    CircuitBreakerRegistry, CircuitBreakerRegistryError, InMemoryCircuitBreakerRegistry,
};
pub use clock::{Clock, ManualClock, MonotonicClock, Stopwatch};
pub use context::{Deferred, GuardedCall, HandlerId, InvocationContext, InvocationEvent};
pub use error::{BoxError, ErrorKind, ResilienceError};
pub use fallback::{Fallback, FallbackConfig};
pub use guard::{Guard, GuardBuilder};
pub use jitter::Jitter;
pub use matcher::{ErrorDecision, ErrorMatcher, ErrorSet};
pub use offload::Offload;
pub use rate_limit::{RateLimit, RateLimitConfig, RateLimitConfigError, RateLimitType, RateLimiter};
pub use retry::{FailureContext, Retry, RetryConfig, RetryConfigError};
pub use service::{GuardLayer, GuardService};
pub use sleeper::{ClockSleeper, InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use strategy::{Invocation, SharedStrategy, Strategy};
pub use timeout::{Timeout, TimeoutConfigError, TimeoutPolicy};
