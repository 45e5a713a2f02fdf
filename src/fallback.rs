//! Fallback strategy
//!
//! On a failure selected by `apply_on`/`skip_on` (skip wins; the cause chain is consulted when
//! the error itself matches neither), the handler is invoked with the error and its result
//! replaces the failure. Other failures, and [`ResilienceError::Cancelled`], propagate unchanged.
//!
//! ```rust
//! use faultguard::{ErrorKind, ErrorMatcher, FallbackConfig};
//!
//! let config = FallbackConfig::handler(|_err| Ok::<_, faultguard::ResilienceError>(0u32))
//!     .skip_on(ErrorMatcher::kind(ErrorKind::Bulkhead))
//!     .build();
//! # let _ = config;
//! ```

use crate::context::{Deferred, InvocationContext};
use crate::error::ResilienceError;
use crate::matcher::{ErrorDecision, ErrorMatcher, ErrorSet};
use crate::strategy::{SharedStrategy, Strategy};
use crate::telemetry::{EventSink, FallbackEvent, NullSink, PolicyEvent, SharedSink};
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

type Handler<V> = Arc<dyn Fn(ResilienceError) -> Deferred<V> + Send + Sync>;

/// Fallback configuration: the handler plus the errors it applies to.
pub struct FallbackConfig<V> {
    handler: Handler<V>,
    decision: ErrorDecision,
    sink: SharedSink,
}

impl<V> fmt::Debug for FallbackConfig<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackConfig").field("decision", &self.decision).finish()
    }
}

impl<V: Send + 'static> FallbackConfig<V> {
    /// Synchronous handler computing a replacement from the triggering error.
    pub fn handler<F>(handler: F) -> FallbackConfigBuilder<V>
    where
        F: Fn(&ResilienceError) -> Result<V, ResilienceError> + Send + Sync + 'static,
    {
        FallbackConfigBuilder::new(Arc::new(move |error: ResilienceError| {
            futures::future::ready(handler(&error)).boxed()
        }))
    }

    /// Asynchronous handler.
    pub fn async_handler<F, Fut>(handler: F) -> FallbackConfigBuilder<V>
    where
        F: Fn(ResilienceError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, ResilienceError>> + Send + 'static,
    {
        FallbackConfigBuilder::new(Arc::new(move |error| handler(error).boxed()))
    }

    /// Replace matching failures with a fixed value.
    pub fn value(value: V) -> FallbackConfigBuilder<V>
    where
        V: Clone + Sync,
    {
        Self::handler(move |_| Ok(value.clone()))
    }
}

/// Builder for [`FallbackConfig`].
pub struct FallbackConfigBuilder<V> {
    handler: Handler<V>,
    apply_on: Option<ErrorSet>,
    skip_on: ErrorSet,
    inspect_cause_chain: bool,
    sink: SharedSink,
}

impl<V> FallbackConfigBuilder<V> {
    fn new(handler: Handler<V>) -> Self {
        Self {
            handler,
            apply_on: None,
            skip_on: ErrorSet::empty(),
            inspect_cause_chain: true,
            sink: Arc::new(NullSink),
        }
    }

    /// Apply only to matching errors (default: every error).
    pub fn apply_on(mut self, matcher: ErrorMatcher) -> Self {
        self.apply_on = Some(self.apply_on.take().unwrap_or_default().with(matcher));
        self
    }

    /// Never apply to matching errors; wins over `apply_on`.
    pub fn skip_on(mut self, matcher: ErrorMatcher) -> Self {
        self.skip_on = self.skip_on.with(matcher);
        self
    }

    /// Whether to walk `source()` when the error itself matches neither set (default: yes).
    pub fn inspect_cause_chain(mut self, inspect: bool) -> Self {
        self.inspect_cause_chain = inspect;
        self
    }

    pub fn sink<S: EventSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn build(self) -> FallbackConfig<V> {
        let decision = ErrorDecision::new(self.apply_on.unwrap_or_else(ErrorSet::all), self.skip_on)
            .inspect_cause_chain(self.inspect_cause_chain);
        FallbackConfig { handler: self.handler, decision, sink: self.sink }
    }
}

/// Fallback strategy around a delegate.
pub struct Fallback<V> {
    delegate: SharedStrategy<V>,
    config: FallbackConfig<V>,
}

impl<V> fmt::Debug for Fallback<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fallback").field("config", &self.config).finish()
    }
}

impl<V: Send + 'static> Fallback<V> {
    pub fn new(delegate: SharedStrategy<V>, config: FallbackConfig<V>) -> Self {
        Self { delegate, config }
    }
}

#[async_trait]
impl<V: Send + 'static> Strategy<V> for Fallback<V> {
    async fn apply(&self, ctx: &Arc<InvocationContext<V>>) -> Result<V, ResilienceError> {
        let error = match self.delegate.apply(ctx).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if error.is_cancelled() || ctx.is_cancelled() || !self.config.decision.is_failure(&error) {
            self.config.sink.record(&PolicyEvent::Fallback(FallbackEvent::Skipped));
            return Err(error);
        }
        tracing::debug!(error = %error, "invoking fallback");
        self.config.sink.record(&PolicyEvent::Fallback(FallbackEvent::Applied));
        (self.config.handler)(error).await
    }
}
