//! Guard: a fixed-order chain of strategies around a guarded call
//!
//! Stack order, outermost first:
//! Fallback → Retry → CircuitBreaker → RateLimit → Timeout → Bulkhead → Offload → Invocation.
//!
//! Each configured strategy wraps the next, building from inside out; strategies that are not
//! configured are simply absent. The chain is built once and shared by every call through the
//! guard, so breaker windows, bulkhead permits and limiter windows are shared too.
//!
//! Dropping a call's future before it completes fires `CANCEL` on its context.

use crate::async_types::{AsyncTypes, UnknownAsyncType};
use crate::bulkhead::{Bulkhead, BulkheadConfig};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerHandle};
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::context::InvocationContext;
use crate::error::{BoxError, ResilienceError};
use crate::fallback::{Fallback, FallbackConfig};
use crate::offload::Offload;
use crate::rate_limit::{RateLimit, RateLimitConfig};
use crate::retry::{Retry, RetryConfig};
use crate::strategy::{Invocation, SharedStrategy, Strategy};
use crate::telemetry::{EventSink, NullSink, PolicyEvent, RequestOutcome, SharedSink};
use crate::timeout::{Timeout, TimeoutPolicy};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::Instant;

/// Fires `CANCEL` unless disarmed.
struct CancelOnDrop<'a, V> {
    ctx: &'a InvocationContext<V>,
    armed: bool,
}

impl<V> Drop for CancelOnDrop<'_, V> {
    fn drop(&mut self) {
        if self.armed {
            tracing::trace!("invocation dropped before completion");
            self.ctx.cancel();
        }
    }
}

/// A built chain of strategies.
pub struct Guard<V> {
    chain: SharedStrategy<V>,
    breaker: Option<CircuitBreakerHandle>,
    sink: SharedSink,
}

impl<V> Clone for Guard<V> {
    fn clone(&self) -> Self {
        Self { chain: self.chain.clone(), breaker: self.breaker.clone(), sink: self.sink.clone() }
    }
}

impl<V> fmt::Debug for Guard<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("circuit_breaker", &self.breaker).finish()
    }
}

impl<V: Send + 'static> Guard<V> {
    pub fn builder() -> GuardBuilder<V> {
        GuardBuilder::new()
    }

    /// Run a prepared context through the chain.
    pub async fn execute(&self, ctx: Arc<InvocationContext<V>>) -> Result<V, ResilienceError> {
        let start = Instant::now();
        let mut cancel = CancelOnDrop { ctx: &ctx, armed: true };
        let result = self.chain.apply(&ctx).await;
        cancel.armed = false;

        let duration = start.elapsed();
        let outcome = match &result {
            Ok(_) => RequestOutcome::Success { duration },
            Err(error) => {
                tracing::debug!(error = %error, ?duration, "guarded call failed");
                RequestOutcome::Failure { duration }
            }
        };
        self.sink.record(&PolicyEvent::Request(outcome));
        result
    }

    /// Guard an async call. The closure runs once per attempt.
    pub async fn call<F, Fut, E>(&self, call: F) -> Result<V, ResilienceError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.execute(Arc::new(InvocationContext::new(call))).await
    }

    /// Guard a synchronous call; each attempt runs on tokio's blocking pool.
    pub async fn call_blocking<F, E>(&self, call: F) -> Result<V, ResilienceError>
    where
        F: Fn() -> Result<V, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        self.execute(Arc::new(InvocationContext::blocking(call))).await
    }

    /// Guard a call returning a native async handle `H`, returning the same kind of handle.
    ///
    /// The converter for `H` is looked up in `types`. Whether anything runs before the returned
    /// handle is polled depends on the converter: boxed futures and streams are lazy and can be
    /// built anywhere, while oneshot and join handles start the chain on a tokio task at once.
    ///
    /// # Panics
    ///
    /// Building a `JoinHandle` outside a tokio runtime panics. A oneshot receiver built there
    /// resolves to a [`NoRuntime`](crate::NoRuntime) error instead.
    pub fn call_async<H, F>(&self, types: &AsyncTypes, make: F) -> Result<H, UnknownAsyncType>
    where
        H: 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let converter = types.get::<H, V>()?;
        let inbound = converter.clone();
        let ctx = Arc::new(InvocationContext::from_deferred(move || inbound.to_deferred(make())));
        let guard = self.clone();
        Ok(converter.from_deferred(Box::new(move || async move { guard.execute(ctx).await }.boxed())))
    }

    /// Handle to the chain's circuit breaker, if one is configured.
    pub fn circuit_breaker(&self) -> Option<&CircuitBreakerHandle> {
        self.breaker.as_ref()
    }

    /// The outermost strategy of the chain.
    pub fn strategy(&self) -> SharedStrategy<V> {
        self.chain.clone()
    }
}

/// Collects strategy configurations; [`GuardBuilder::build`] nests them in the fixed order.
pub struct GuardBuilder<V> {
    fallback: Option<FallbackConfig<V>>,
    retry: Option<RetryConfig<V>>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    rate_limit: Option<RateLimitConfig>,
    timeout: Option<TimeoutPolicy>,
    bulkhead: Option<BulkheadConfig>,
    offload: Option<Option<Handle>>,
    registry: Option<Arc<dyn CircuitBreakerRegistry>>,
    sink: SharedSink,
}

impl<V: Send + 'static> Default for GuardBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + 'static> GuardBuilder<V> {
    pub fn new() -> Self {
        Self {
            fallback: None,
            retry: None,
            circuit_breaker: None,
            rate_limit: None,
            timeout: None,
            bulkhead: None,
            offload: None,
            registry: None,
            sink: Arc::new(NullSink),
        }
    }

    pub fn fallback(mut self, config: FallbackConfig<V>) -> Self {
        self.fallback = Some(config);
        self
    }

    pub fn retry(mut self, config: RetryConfig<V>) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn timeout(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout = Some(policy);
        self
    }

    pub fn bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    /// Run each attempt on its own task so timeouts and cancellation can abort it.
    pub fn offload(mut self) -> Self {
        self.offload = Some(None);
        self
    }

    /// Like [`GuardBuilder::offload`], spawning onto `runtime`.
    pub fn offload_to(mut self, runtime: Handle) -> Self {
        self.offload = Some(Some(runtime));
        self
    }

    /// Register the circuit breaker under its name when the guard is built.
    pub fn registry(mut self, registry: Arc<dyn CircuitBreakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sink for whole-request outcome events.
    pub fn sink<S: EventSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn build(self) -> Guard<V> {
        let mut chain: SharedStrategy<V> = Invocation::shared();
        if let Some(runtime) = self.offload {
            chain = Arc::new(match runtime {
                Some(runtime) => Offload::on(chain, runtime),
                None => Offload::new(chain),
            });
        }
        if let Some(config) = self.bulkhead {
            chain = Arc::new(Bulkhead::new(chain, config));
        }
        if let Some(policy) = self.timeout {
            chain = Arc::new(Timeout::new(chain, policy));
        }
        if let Some(config) = self.rate_limit {
            chain = Arc::new(RateLimit::new(chain, config));
        }
        let mut breaker = None;
        if let Some(config) = self.circuit_breaker {
            let cb = CircuitBreaker::new(chain, config);
            let handle = cb.handle();
            if let Some(registry) = &self.registry {
                if let Err(error) = registry.register_named(handle.clone()) {
                    tracing::warn!(%error, "circuit breaker not registered");
                }
            }
            breaker = Some(handle);
            chain = Arc::new(cb);
        }
        if let Some(config) = self.retry {
            chain = Arc::new(Retry::new(chain, config));
        }
        if let Some(config) = self.fallback {
            chain = Arc::new(Fallback::new(chain, config));
        }
        Guard { chain, breaker, sink: self.sink }
    }
}
