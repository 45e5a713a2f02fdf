//! Retry strategy
//!
//! Semantics:
//! - The first call runs immediately. `max_retries` counts *re*-tries, so a permanently failing
//!   call runs `max_retries + 1` times; `None` means unbounded (then `max_duration` is the only
//!   bound).
//! - An error is retried when the [`ErrorDecision`] built from `retry_on`/`abort_on` considers it
//!   a failure. A value is retried when the `retry_on_result` predicate accepts it. When the call
//!   raised, only the error decision is consulted.
//! - [`ResilienceError::Cancelled`] is never retried.
//! - When the bound is hit, the strategy raises [`ResilienceError::RetryExhausted`] carrying the
//!   last error (or no cause if the last attempt produced a rejected value).
//! - Between attempts: the before-retry hook runs, then the backoff delay plus jitter is slept
//!   through the [`Sleeper`]. The sleep holds no lock and ends early on cancellation.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use faultguard::{Backoff, Jitter, RetryConfig};
//!
//! let config = RetryConfig::<u32>::builder()
//!     .max_retries(5)
//!     .backoff(Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(2)).unwrap())
//!     .jitter(Jitter::bounded(Duration::from_millis(50)))
//!     .max_duration(Duration::from_secs(30))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.max_retries(), Some(5));
//! ```

use crate::backoff::{Backoff, BackoffSequence};
use crate::clock::{Clock, MonotonicClock, Stopwatch};
use crate::context::InvocationContext;
use crate::error::ResilienceError;
use crate::jitter::Jitter;
use crate::matcher::{ErrorDecision, ErrorMatcher, ErrorSet};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::strategy::{SharedStrategy, Strategy};
use crate::telemetry::{EventSink, NullSink, PolicyEvent, RetryEvent, SharedSink};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Information handed to the before-retry hook.
#[derive(Debug, Clone, Copy)]
pub struct FailureContext<'a> {
    /// Calls made so far (1 before the first retry).
    pub attempt: usize,
    /// Error raised by the last call; `None` when a returned value triggered the retry.
    pub failure: Option<&'a ResilienceError>,
}

type ResultPredicate<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;
type BeforeRetry = Arc<dyn for<'a> Fn(&FailureContext<'a>) + Send + Sync>;

/// Errors produced while building a retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryConfigError {
    #[error("max delay ({delay:?}) must be less than max duration ({max_duration:?})")]
    DelayNotBelowMaxDuration { delay: Duration, max_duration: Duration },
}

/// Validated, immutable retry configuration.
pub struct RetryConfig<V> {
    max_retries: Option<usize>,
    max_duration: Option<Duration>,
    backoff: Backoff,
    jitter: Jitter,
    decision: ErrorDecision,
    retry_on_result: Option<ResultPredicate<V>>,
    before_retry: Option<BeforeRetry>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
}

impl<V> fmt::Debug for RetryConfig<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("max_duration", &self.max_duration)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("decision", &self.decision)
            .field("retry_on_result", &self.retry_on_result.as_ref().map(|_| "<predicate>"))
            .field("before_retry", &self.before_retry.as_ref().map(|_| "<hook>"))
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl<V> RetryConfig<V> {
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryConfigBuilder<V> {
        RetryConfigBuilder::new()
    }

    pub fn max_retries(&self) -> Option<usize> {
        self.max_retries
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    fn retries_exhausted(&self, calls: usize) -> bool {
        self.max_retries.map_or(false, |max| calls.saturating_sub(1) >= max)
    }

    fn duration_exceeded(&self, watch: &Stopwatch) -> bool {
        self.max_duration.map_or(false, |max| watch.elapsed() >= max)
    }

    fn next_delay(&self, backoff: &mut BackoffSequence, failure: Option<&ResilienceError>) -> Duration {
        self.jitter.apply(backoff.next_delay(failure))
    }
}

/// Builder for [`RetryConfig`].
pub struct RetryConfigBuilder<V> {
    max_retries: Option<usize>,
    max_duration: Option<Duration>,
    backoff: Backoff,
    jitter: Jitter,
    retry_on: Option<ErrorSet>,
    abort_on: ErrorSet,
    inspect_cause_chain: bool,
    retry_on_result: Option<ResultPredicate<V>>,
    before_retry: Option<BeforeRetry>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
}

impl<V> RetryConfigBuilder<V> {
    /// Defaults: 3 retries, no delay, ±200 ms jitter, 180 s max duration, retry on every error.
    pub fn new() -> Self {
        Self {
            max_retries: Some(3),
            max_duration: Some(Duration::from_secs(180)),
            backoff: Backoff::constant(Duration::ZERO),
            jitter: Jitter::bounded(Duration::from_millis(200)),
            retry_on: None,
            abort_on: ErrorSet::empty(),
            inspect_cause_chain: false,
            retry_on_result: None,
            before_retry: None,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
            sink: Arc::new(NullSink),
        }
    }

    /// Retries after the initial call.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Retry until `max_duration` (if any) runs out.
    pub fn unbounded_retries(mut self) -> Self {
        self.max_retries = None;
        self
    }

    /// Upper bound on time spent retrying, measured from the first call. Zero means unbounded.
    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = if duration.is_zero() { None } else { Some(duration) };
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Retry only on errors matching one of the given matchers (default: every error).
    pub fn retry_on(mut self, matcher: ErrorMatcher) -> Self {
        self.retry_on = Some(self.retry_on.take().unwrap_or_default().with(matcher));
        self
    }

    /// Never retry errors matching this matcher; wins over `retry_on`.
    pub fn abort_on(mut self, matcher: ErrorMatcher) -> Self {
        self.abort_on = self.abort_on.with(matcher);
        self
    }

    /// Also match errors by their `source()` chain.
    pub fn inspect_cause_chain(mut self, inspect: bool) -> Self {
        self.inspect_cause_chain = inspect;
        self
    }

    /// Retry when the call returns a value the predicate accepts.
    pub fn retry_on_result<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&V) -> bool + Send + Sync + 'static,
    {
        self.retry_on_result = Some(Arc::new(predicate));
        self
    }

    /// Hook run before each retry's delay. Must not panic.
    pub fn before_retry<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&FailureContext<'a>) + Send + Sync + 'static,
    {
        self.before_retry = Some(Arc::new(hook));
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: EventSink + 'static,
    {
        self.sink = Arc::new(sink);
        self
    }

    /// Build the configuration, validating inputs.
    pub fn build(self) -> Result<RetryConfig<V>, RetryConfigError> {
        if let (Some(delay), Some(max_duration)) = (self.backoff.max(), self.max_duration) {
            if delay >= max_duration {
                return Err(RetryConfigError::DelayNotBelowMaxDuration { delay, max_duration });
            }
        }
        let decision = ErrorDecision::new(self.retry_on.unwrap_or_else(ErrorSet::all), self.abort_on)
            .inspect_cause_chain(self.inspect_cause_chain);
        Ok(RetryConfig {
            max_retries: self.max_retries,
            max_duration: self.max_duration,
            backoff: self.backoff,
            jitter: self.jitter,
            decision,
            retry_on_result: self.retry_on_result,
            before_retry: self.before_retry,
            sleeper: self.sleeper,
            clock: self.clock,
            sink: self.sink,
        })
    }
}

impl<V> Default for RetryConfigBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry strategy around a delegate.
pub struct Retry<V> {
    delegate: SharedStrategy<V>,
    config: Arc<RetryConfig<V>>,
}

impl<V> fmt::Debug for Retry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry").field("config", &self.config).finish()
    }
}

impl<V: Send + 'static> Retry<V> {
    pub fn new(delegate: SharedStrategy<V>, config: RetryConfig<V>) -> Self {
        Self { delegate, config: Arc::new(config) }
    }

    fn exhausted(&self, calls: usize, last: Option<ResilienceError>, watch: &Stopwatch) -> ResilienceError {
        let total_duration = watch.elapsed();
        tracing::debug!(attempts = calls, ?total_duration, "retries exhausted");
        self.config.sink.record(&PolicyEvent::Retry(RetryEvent::Exhausted {
            total_attempts: calls,
            total_duration,
        }));
        ResilienceError::RetryExhausted { attempts: calls, last: last.map(Box::new) }
    }
}

#[async_trait]
impl<V: Send + 'static> Strategy<V> for Retry<V> {
    async fn apply(&self, ctx: &Arc<InvocationContext<V>>) -> Result<V, ResilienceError> {
        let config = &self.config;
        let watch = Stopwatch::start(config.clock.clone());
        let mut backoff = config.backoff.start();
        let mut calls = 0usize;

        loop {
            calls += 1;
            let last = match self.delegate.apply(ctx).await {
                Ok(value) => {
                    let retry_value = config.retry_on_result.as_ref().map_or(false, |p| p(&value));
                    if !retry_value {
                        config
                            .sink
                            .record(&PolicyEvent::Retry(RetryEvent::Succeeded { total_attempts: calls }));
                        return Ok(value);
                    }
                    tracing::trace!(attempt = calls, "result rejected by retry predicate");
                    None
                }
                Err(error) => {
                    if error.is_cancelled() || ctx.is_cancelled() || config.decision.is_expected(&error) {
                        config
                            .sink
                            .record(&PolicyEvent::Retry(RetryEvent::NotRetried { total_attempts: calls }));
                        return Err(error);
                    }
                    Some(error)
                }
            };

            if config.retries_exhausted(calls) || config.duration_exceeded(&watch) {
                return Err(self.exhausted(calls, last, &watch));
            }

            if let Some(hook) = &config.before_retry {
                hook(&FailureContext { attempt: calls, failure: last.as_ref() });
            }

            let delay = config.next_delay(&mut backoff, last.as_ref());
            tracing::debug!(attempt = calls, ?delay, "invocation failed, retrying");
            config.sink.record(&PolicyEvent::Retry(RetryEvent::Attempt { attempt: calls, delay }));

            tokio::select! {
                _ = config.sleeper.sleep(delay) => {}
                _ = ctx.cancelled() => return Err(ResilienceError::Cancelled),
            }

            if config.duration_exceeded(&watch) {
                return Err(self.exhausted(calls, last, &watch));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::sleeper::{ClockSleeper, InstantSleeper, TrackingSleeper};
    use crate::strategy::Invocation;
    use crate::telemetry::MemorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[derive(Debug)]
    struct Fatal;

    impl std::fmt::Display for Fatal {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fatal")
        }
    }

    impl std::error::Error for Fatal {}

    fn quiet() -> RetryConfigBuilder<u32> {
        RetryConfig::builder().jitter(Jitter::None).sleeper(InstantSleeper)
    }

    /// Fails the first `failures` calls, then returns the call index.
    fn flaky(counter: Arc<AtomicUsize>, failures: usize) -> Arc<InvocationContext<u32>> {
        Arc::new(InvocationContext::new(move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(TestError(format!("attempt {}", n)))
                } else {
                    Ok(n as u32)
                }
            }
        }))
    }

    #[tokio::test]
    async fn success_first_attempt() {
        let retry = Retry::new(Invocation::shared(), quiet().build().unwrap());
        let counter = Arc::new(AtomicUsize::new(0));
        assert_eq!(retry.apply(&flaky(counter.clone(), 0)).await.unwrap(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "Should only execute once");
    }

    #[tokio::test]
    async fn success_after_retries() {
        let retry = Retry::new(Invocation::shared(), quiet().max_retries(5).build().unwrap());
        let counter = Arc::new(AtomicUsize::new(0));
        assert_eq!(retry.apply(&flaky(counter.clone(), 2)).await.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3, "Should succeed on 3rd attempt");
    }

    #[tokio::test]
    async fn exhaustion_runs_max_retries_plus_one() {
        let retry = Retry::new(Invocation::shared(), quiet().max_retries(3).build().unwrap());
        let counter = Arc::new(AtomicUsize::new(0));
        let err = retry.apply(&flaky(counter.clone(), usize::MAX)).await.unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        match &err {
            ResilienceError::RetryExhausted { attempts, last } => {
                assert_eq!(*attempts, 4);
                let last = last.as_deref().expect("last failure");
                assert_eq!(last.downcast_inner::<TestError>(), Some(&TestError("attempt 3".into())));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_retries_calls_once() {
        let retry = Retry::new(Invocation::shared(), quiet().max_retries(0).build().unwrap());
        let counter = Arc::new(AtomicUsize::new(0));
        let err = retry.apply(&flaky(counter.clone(), usize::MAX)).await.unwrap_err();
        assert!(err.is_retry_exhausted());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unmatched_error_is_not_retried() {
        let config = quiet().max_retries(5).retry_on(ErrorMatcher::of::<Fatal>()).build().unwrap();
        let retry = Retry::new(Invocation::shared(), config);
        let counter = Arc::new(AtomicUsize::new(0));
        let err = retry.apply(&flaky(counter.clone(), usize::MAX)).await.unwrap_err();
        assert_eq!(err.downcast_inner::<TestError>(), Some(&TestError("attempt 0".into())));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_on_wins_over_retry_on() {
        let config = quiet()
            .max_retries(5)
            .retry_on(ErrorMatcher::of::<TestError>())
            .abort_on(ErrorMatcher::of::<TestError>())
            .build()
            .unwrap();
        let retry = Retry::new(Invocation::shared(), config);
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(retry.apply(&flaky(counter.clone(), usize::MAX)).await.unwrap_err().is_inner());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn strategy_errors_can_be_matched_by_kind() {
        let config = quiet().max_retries(2).abort_on(ErrorMatcher::kind(ErrorKind::CircuitOpen)).build().unwrap();
        let retry = Retry::new(Invocation::shared(), config);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let ctx: Arc<InvocationContext<u32>> = Arc::new(InvocationContext::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ResilienceError::CircuitOpen { half_open: false, open_for: Duration::ZERO })
            }
        }));
        let err = retry.apply(&ctx).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn result_predicate_retries_values_and_exhausts_without_cause() {
        let config = quiet().max_retries(2).retry_on_result(|v: &u32| *v < 10).build().unwrap();
        let retry = Retry::new(Invocation::shared(), config);
        let counter = Arc::new(AtomicUsize::new(0));
        let err = retry.apply(&flaky(counter.clone(), 0)).await.unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(err.is_retry_exhausted());
        assert!(err.last_failure().is_none());
    }

    #[tokio::test]
    async fn result_predicate_accepts_eventual_value() {
        let config = quiet().max_retries(5).retry_on_result(|v: &u32| *v < 2).build().unwrap();
        let retry = Retry::new(Invocation::shared(), config);
        let counter = Arc::new(AtomicUsize::new(0));
        assert_eq!(retry.apply(&flaky(counter, 0)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn backoff_delays_are_slept_in_order() {
        let sleeper = TrackingSleeper::new();
        let config = RetryConfig::builder()
            .max_retries(4)
            .jitter(Jitter::None)
            .backoff(Backoff::fibonacci(Duration::from_millis(10)))
            .sleeper(sleeper.clone())
            .build()
            .unwrap();
        let retry = Retry::new(Invocation::shared(), config);
        let counter = Arc::new(AtomicUsize::new(0));
        let _ = retry.apply(&flaky(counter, usize::MAX)).await;
        let millis: Vec<u128> = sleeper.calls().iter().map(Duration::as_millis).collect();
        assert_eq!(millis, vec![10, 20, 30, 50]);
    }

    #[tokio::test]
    async fn before_retry_hook_sees_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let config = quiet()
            .max_retries(2)
            .before_retry(move |ctx: &FailureContext<'_>| {
                let msg = ctx.failure.map(|e| e.to_string()).unwrap_or_default();
                s.lock().unwrap().push((ctx.attempt, msg));
            })
            .build()
            .unwrap();
        let retry = Retry::new(Invocation::shared(), config);
        let _ = retry.apply(&flaky(Arc::new(AtomicUsize::new(0)), usize::MAX)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, "TestError: attempt 0".to_string()), (2, "TestError: attempt 1".to_string())]
        );
    }

    #[tokio::test]
    async fn max_duration_bounds_unbounded_retries() {
        let clock = ManualClock::new();
        let config = RetryConfig::builder()
            .unbounded_retries()
            .jitter(Jitter::None)
            .backoff(Backoff::constant(Duration::from_millis(100)))
            .max_duration(Duration::from_millis(1_000))
            .clock(clock.clone())
            .sleeper(ClockSleeper::new(clock.clone()))
            .build()
            .unwrap();
        let retry = Retry::new(Invocation::shared(), config);
        let counter = Arc::new(AtomicUsize::new(0));
        let err = retry.apply(&flaky(counter.clone(), usize::MAX)).await.unwrap_err();
        assert!(err.is_retry_exhausted());
        // calls at t = 0, 100, ..., 900; the sleep to 1000 exhausts the budget
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(clock.now_millis(), 1_000);
    }

    #[tokio::test]
    async fn cancelled_errors_are_not_retried() {
        let retry = Retry::new(Invocation::shared(), quiet().max_retries(3).build().unwrap());
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let ctx: Arc<InvocationContext<u32>> = Arc::new(InvocationContext::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(ResilienceError::Cancelled) }
        }));
        assert!(retry.apply(&ctx).await.unwrap_err().is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff_sleep() {
        let config = RetryConfig::builder()
            .max_retries(3)
            .jitter(Jitter::None)
            .backoff(Backoff::constant(Duration::from_secs(60)))
            .build()
            .unwrap();
        let retry = Arc::new(Retry::new(Invocation::shared(), config));
        let ctx = flaky(Arc::new(AtomicUsize::new(0)), usize::MAX);
        let task = {
            let (retry, ctx) = (retry.clone(), ctx.clone());
            tokio::spawn(async move { retry.apply(&ctx).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        ctx.cancel();
        assert!(task.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn events_are_recorded() {
        let sink = MemorySink::new();
        let config = quiet().max_retries(1).sink(sink.clone()).build().unwrap();
        let retry = Retry::new(Invocation::shared(), config);
        let _ = retry.apply(&flaky(Arc::new(AtomicUsize::new(0)), usize::MAX)).await;
        let events = sink.events();
        assert!(matches!(events[0], PolicyEvent::Retry(RetryEvent::Attempt { attempt: 1, .. })));
        assert!(matches!(
            events[1],
            PolicyEvent::Retry(RetryEvent::Exhausted { total_attempts: 2, .. })
        ));
    }

    #[test]
    fn max_delay_must_be_below_max_duration() {
        let err = RetryConfig::<u32>::builder()
            .backoff(Backoff::constant(Duration::from_secs(5)))
            .max_duration(Duration::from_secs(5))
            .build()
            .unwrap_err();
        assert!(matches!(err, RetryConfigError::DelayNotBelowMaxDuration { .. }));

        let capped = Backoff::exponential(Duration::from_millis(100))
            .with_max(Duration::from_secs(10))
            .unwrap();
        assert!(RetryConfig::<u32>::builder()
            .backoff(capped)
            .max_duration(Duration::from_secs(2))
            .build()
            .is_err());
    }

    #[test]
    fn defaults_follow_documented_values() {
        let config = RetryConfig::<u32>::builder().build().unwrap();
        assert_eq!(config.max_retries(), Some(3));
        assert_eq!(config.max_duration(), Some(Duration::from_secs(180)));
        assert_eq!(config.backoff().base(), Duration::ZERO);
    }
}
