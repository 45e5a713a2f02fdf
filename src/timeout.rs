//! Timeout policy implementation
//!
//! The delegate is raced against a deadline. When the deadline wins, the delegate's future is
//! dropped, [`InvocationEvent::Timeout`] is fired on the context so whoever owns the execution
//! substrate can interrupt the work, and the caller gets [`ResilienceError::Timeout`]. Whatever
//! the abandoned work produces later is discarded.
//!
//! The deadline itself is a tokio timer. Elapsed times in events and errors come from the
//! policy's [`Clock`].

use crate::clock::{Clock, MonotonicClock, Stopwatch};
use crate::context::{InvocationContext, InvocationEvent};
use crate::error::ResilienceError;
use crate::strategy::{SharedStrategy, Strategy};
use crate::telemetry::{EventSink, NullSink, PolicyEvent, SharedSink, TimeoutEvent};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Errors produced when validating timeout configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutConfigError {
    #[error("timeout duration must be non-zero")]
    Zero,
    #[error("timeout duration must be finite")]
    Unbounded,
}

#[derive(Clone)]
pub struct TimeoutPolicy {
    duration: Duration,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
}

impl fmt::Debug for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutPolicy").field("duration", &self.duration).finish()
    }
}

impl Default for TimeoutPolicy {
    /// One second.
    fn default() -> Self {
        Self { duration: Duration::from_secs(1), clock: Arc::new(MonotonicClock::default()), sink: Arc::new(NullSink) }
    }
}

impl TimeoutPolicy {
    /// Create a timeout policy. Rejects zero and `Duration::MAX`.
    pub fn new(duration: Duration) -> Result<Self, TimeoutConfigError> {
        if duration.is_zero() {
            return Err(TimeoutConfigError::Zero);
        }
        if duration == Duration::MAX {
            return Err(TimeoutConfigError::Unbounded);
        }
        Ok(Self { duration, ..Self::default() })
    }

    /// Clock used to measure elapsed time.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_sink<S: EventSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// Timeout strategy around a delegate.
pub struct Timeout<V> {
    delegate: SharedStrategy<V>,
    policy: TimeoutPolicy,
}

impl<V> fmt::Debug for Timeout<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout").field("policy", &self.policy).finish()
    }
}

impl<V: Send + 'static> Timeout<V> {
    pub fn new(delegate: SharedStrategy<V>, policy: TimeoutPolicy) -> Self {
        Self { delegate, policy }
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }
}

#[async_trait]
impl<V: Send + 'static> Strategy<V> for Timeout<V> {
    async fn apply(&self, ctx: &Arc<InvocationContext<V>>) -> Result<V, ResilienceError> {
        let timeout = self.policy.duration;
        let stopwatch = Stopwatch::start(self.policy.clock.clone());

        match tokio::time::timeout(timeout, self.delegate.apply(ctx)).await {
            Ok(result) => {
                let elapsed = stopwatch.elapsed();
                self.policy.sink.record(&PolicyEvent::Timeout(TimeoutEvent::Completed { elapsed }));
                result
            }
            Err(_) => {
                let elapsed = stopwatch.elapsed();
                tracing::debug!(?timeout, ?elapsed, "invocation timed out");
                ctx.fire(InvocationEvent::Timeout);
                self.policy.sink.record(&PolicyEvent::Timeout(TimeoutEvent::Occurred { timeout }));
                Err(ResilienceError::Timeout { elapsed, timeout })
            }
        }
    }
}
