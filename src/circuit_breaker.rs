//! Circuit breaker driven by a rolling outcome window.
//!
//! - **Closed**: every call is delegated and its outcome pushed into a window of the last
//!   `request_volume_threshold` outcomes. Once the window is full and
//!   `failures >= ceil(failure_ratio * request_volume_threshold)`, the breaker opens.
//! - **Open**: calls are rejected with [`ResilienceError::CircuitOpen`] without touching the
//!   delegate. The first call after `delay` has elapsed moves the breaker to half-open; there is
//!   no background timer.
//! - **HalfOpen**: at most `success_threshold` probe calls are admitted; others are rejected.
//!   `success_threshold` consecutive successes close the breaker with a fresh window, any
//!   failure re-opens it.
//!
//! Rejections are reported to listeners but never enter the window. Errors considered expected
//! by the breaker's [`ErrorDecision`] (`skip_on`) count as successes. A call that is cancelled
//! before it settles is not an outcome.
//!
//! All state lives behind one mutex. Each transition bumps a generation number; an outcome is
//! only applied to the generation that admitted it, so a slow call that started while closed
//! cannot re-open a breaker that has since been reset or moved on.

use crate::clock::{Clock, MonotonicClock};
use crate::context::InvocationContext;
use crate::error::ResilienceError;
use crate::matcher::{ErrorDecision, ErrorMatcher, ErrorSet};
use crate::strategy::{SharedStrategy, Strategy};
use crate::telemetry::{CircuitBreakerEvent, EventSink, NullSink, PolicyEvent, SharedSink};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the delay elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

/// Observer of breaker activity. Called synchronously on the invoking task, outside the
/// breaker's lock; implementations must be thread-safe and must not panic.
pub trait CircuitBreakerListener: Send + Sync {
    fn succeeded(&self) {}
    fn failed(&self) {}
    fn rejected(&self) {}
    fn state_changed(&self, _from: CircuitState, _to: CircuitState) {}
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CircuitBreakerConfigError {
    #[error("request_volume_threshold must be > 0")]
    InvalidRequestVolume,
    #[error("failure_ratio must be within [0, 1] (got {0})")]
    InvalidFailureRatio(f64),
    #[error("success_threshold must be > 0")]
    InvalidSuccessThreshold,
}

/// Validated configuration for the circuit breaker.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    name: Option<String>,
    request_volume_threshold: usize,
    failure_ratio: f64,
    failure_threshold: usize,
    delay: Duration,
    success_threshold: usize,
    decision: ErrorDecision,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
    listeners: Vec<Arc<dyn CircuitBreakerListener>>,
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("name", &self.name)
            .field("request_volume_threshold", &self.request_volume_threshold)
            .field("failure_ratio", &self.failure_ratio)
            .field("delay", &self.delay)
            .field("success_threshold", &self.success_threshold)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Rolling window size.
    pub fn request_volume_threshold(&self) -> usize {
        self.request_volume_threshold
    }

    pub fn failure_ratio(&self) -> f64 {
        self.failure_ratio
    }

    /// Failures in a full window that open the breaker.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn success_threshold(&self) -> usize {
        self.success_threshold
    }
}

/// Builder for [`CircuitBreakerConfig`].
pub struct CircuitBreakerConfigBuilder {
    name: Option<String>,
    request_volume_threshold: usize,
    failure_ratio: f64,
    delay: Duration,
    success_threshold: usize,
    fail_on: Option<ErrorSet>,
    skip_on: ErrorSet,
    inspect_cause_chain: bool,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
    listeners: Vec<Arc<dyn CircuitBreakerListener>>,
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfigBuilder {
    /// Defaults: window of 20, ratio 0.5, 5 s delay, 1 success to close, every error fails.
    pub fn new() -> Self {
        Self {
            name: None,
            request_volume_threshold: 20,
            failure_ratio: 0.5,
            delay: Duration::from_secs(5),
            success_threshold: 1,
            fail_on: None,
            skip_on: ErrorSet::empty(),
            inspect_cause_chain: false,
            clock: Arc::new(MonotonicClock::default()),
            sink: Arc::new(NullSink),
            listeners: Vec::new(),
        }
    }

    /// Name used for logging and registry lookup.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn request_volume_threshold(mut self, volume: usize) -> Self {
        self.request_volume_threshold = volume;
        self
    }

    pub fn failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio;
        self
    }

    /// Time to stay open before admitting probes.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn success_threshold(mut self, successes: usize) -> Self {
        self.success_threshold = successes;
        self
    }

    /// Count only matching errors as failures (default: every error).
    pub fn fail_on(mut self, matcher: ErrorMatcher) -> Self {
        self.fail_on = Some(self.fail_on.take().unwrap_or_default().with(matcher));
        self
    }

    /// Count matching errors as successes; wins over `fail_on`.
    pub fn skip_on(mut self, matcher: ErrorMatcher) -> Self {
        self.skip_on = self.skip_on.with(matcher);
        self
    }

    pub fn inspect_cause_chain(mut self, inspect: bool) -> Self {
        self.inspect_cause_chain = inspect;
        self
    }

    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn sink<S: EventSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn listener<L: CircuitBreakerListener + 'static>(mut self, listener: L) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, CircuitBreakerConfigError> {
        if self.request_volume_threshold == 0 {
            return Err(CircuitBreakerConfigError::InvalidRequestVolume);
        }
        if !(0.0..=1.0).contains(&self.failure_ratio) {
            return Err(CircuitBreakerConfigError::InvalidFailureRatio(self.failure_ratio));
        }
        if self.success_threshold == 0 {
            return Err(CircuitBreakerConfigError::InvalidSuccessThreshold);
        }
        let failure_threshold =
            (self.failure_ratio * self.request_volume_threshold as f64).ceil() as usize;
        let decision = ErrorDecision::new(self.fail_on.unwrap_or_else(ErrorSet::all), self.skip_on)
            .inspect_cause_chain(self.inspect_cause_chain);
        Ok(CircuitBreakerConfig {
            name: self.name,
            request_volume_threshold: self.request_volume_threshold,
            failure_ratio: self.failure_ratio,
            failure_threshold,
            delay: self.delay,
            success_threshold: self.success_threshold,
            decision,
            clock: self.clock,
            sink: self.sink,
            listeners: self.listeners,
        })
    }
}

/// Fixed-capacity record of the most recent outcomes.
#[derive(Debug)]
struct RollingWindow {
    outcomes: VecDeque<bool>,
    capacity: usize,
    failures: usize,
    failure_threshold: usize,
}

impl RollingWindow {
    fn new(capacity: usize, failure_threshold: usize) -> Self {
        Self { outcomes: VecDeque::with_capacity(capacity), capacity, failures: 0, failure_threshold }
    }

    /// Record one outcome; `true` once a full window holds enough failures.
    fn record(&mut self, failure: bool) -> bool {
        if self.outcomes.len() == self.capacity && self.outcomes.pop_front() == Some(true) {
            self.failures -= 1;
        }
        self.outcomes.push_back(failure);
        if failure {
            self.failures += 1;
        }
        self.outcomes.len() == self.capacity && self.failures >= self.failure_threshold
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    window: RollingWindow,
    opened_at: u64,
    probe_attempts: usize,
    consecutive_successes: usize,
}

enum Admission {
    Closed { generation: u64 },
    Probe { generation: u64 },
    Rejected { half_open: bool, open_for: Duration },
}

type Transition = (CircuitState, CircuitState);

/// Shared breaker state, used by the strategy and by maintenance handles.
struct BreakerCore {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl BreakerCore {
    fn new(config: CircuitBreakerConfig) -> Self {
        let window = RollingWindow::new(config.request_volume_threshold, config.failure_threshold);
        Self {
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                window,
                opened_at: 0,
                probe_attempts: 0,
                consecutive_successes: 0,
            }),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn label(&self) -> &str {
        self.config.name.as_deref().unwrap_or("circuit breaker")
    }

    fn new_window(&self) -> RollingWindow {
        RollingWindow::new(self.config.request_volume_threshold, self.config.failure_threshold)
    }

    fn to_open(&self, s: &mut BreakerState, now: u64) -> Transition {
        let from = s.state;
        s.state = CircuitState::Open;
        s.generation += 1;
        s.opened_at = now;
        s.probe_attempts = 0;
        s.consecutive_successes = 0;
        (from, CircuitState::Open)
    }

    fn to_half_open(&self, s: &mut BreakerState) -> Transition {
        let from = s.state;
        s.state = CircuitState::HalfOpen;
        s.generation += 1;
        s.probe_attempts = 0;
        s.consecutive_successes = 0;
        (from, CircuitState::HalfOpen)
    }

    fn to_closed(&self, s: &mut BreakerState) -> Transition {
        let from = s.state;
        s.state = CircuitState::Closed;
        s.generation += 1;
        s.window = self.new_window();
        s.probe_attempts = 0;
        s.consecutive_successes = 0;
        (from, CircuitState::Closed)
    }

    /// Lazy OPEN -> HALF_OPEN once the delay has elapsed.
    fn maybe_half_open(&self, s: &mut BreakerState, now: u64) -> Option<Transition> {
        let delay = u64::try_from(self.config.delay.as_millis()).unwrap_or(u64::MAX);
        if s.state == CircuitState::Open && now.saturating_sub(s.opened_at) >= delay {
            Some(self.to_half_open(s))
        } else {
            None
        }
    }

    fn admit(&self) -> Admission {
        let now = self.config.clock.now_millis();
        let (admission, transition) = {
            let mut s = self.lock();
            let transition = self.maybe_half_open(&mut s, now);
            let admission = match s.state {
                CircuitState::Closed => Admission::Closed { generation: s.generation },
                CircuitState::Open => Admission::Rejected {
                    half_open: false,
                    open_for: Duration::from_millis(now.saturating_sub(s.opened_at)),
                },
                CircuitState::HalfOpen => {
                    if s.probe_attempts < self.config.success_threshold {
                        s.probe_attempts += 1;
                        Admission::Probe { generation: s.generation }
                    } else {
                        Admission::Rejected {
                            half_open: true,
                            open_for: Duration::from_millis(now.saturating_sub(s.opened_at)),
                        }
                    }
                }
            };
            (admission, transition)
        };
        if let Some(transition) = transition {
            self.announce(transition, 0);
        }
        if let Admission::Rejected { half_open, .. } = admission {
            tracing::debug!(breaker = self.label(), half_open, "invocation prevented by circuit breaker");
            self.config
                .sink
                .record(&PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Rejected { half_open }));
            for listener in &self.config.listeners {
                listener.rejected();
            }
        }
        admission
    }

    fn record(&self, generation: u64, probe: bool, success: bool) {
        let now = self.config.clock.now_millis();
        let (transition, failures) = {
            let mut s = self.lock();
            if s.generation != generation {
                (None, 0)
            } else if probe {
                if success {
                    s.consecutive_successes += 1;
                    if s.consecutive_successes >= self.config.success_threshold {
                        (Some(self.to_closed(&mut s)), 0)
                    } else {
                        (None, 0)
                    }
                } else {
                    (Some(self.to_open(&mut s, now)), 1)
                }
            } else if s.window.record(!success) {
                let failures = s.window.failures;
                (Some(self.to_open(&mut s, now)), failures)
            } else {
                (None, 0)
            }
        };

        let event = if success { CircuitBreakerEvent::Succeeded } else { CircuitBreakerEvent::Failed };
        self.config.sink.record(&PolicyEvent::CircuitBreaker(event));
        for listener in &self.config.listeners {
            if success {
                listener.succeeded();
            } else {
                listener.failed();
            }
        }
        if let Some(transition) = transition {
            self.announce(transition, failures);
        }
    }

    fn release_probe(&self, generation: u64) {
        let mut s = self.lock();
        if s.generation == generation && s.state == CircuitState::HalfOpen {
            s.probe_attempts = s.probe_attempts.saturating_sub(1);
        }
    }

    fn announce(&self, (from, to): Transition, failures: usize) {
        let name = self.label();
        let event = match to {
            CircuitState::Open => {
                if from == CircuitState::HalfOpen {
                    tracing::warn!(breaker = name, "probe failed, circuit breaker → open");
                } else {
                    tracing::error!(
                        breaker = name,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker → open"
                    );
                }
                CircuitBreakerEvent::Opened {
                    failure_count: failures,
                    window_size: if from == CircuitState::HalfOpen {
                        1
                    } else {
                        self.config.request_volume_threshold
                    },
                }
            }
            CircuitState::HalfOpen => {
                tracing::info!(breaker = name, "circuit breaker → half-open");
                CircuitBreakerEvent::HalfOpen
            }
            CircuitState::Closed => {
                tracing::info!(breaker = name, "circuit breaker → closed");
                CircuitBreakerEvent::Closed
            }
        };
        self.config.sink.record(&PolicyEvent::CircuitBreaker(event));
        for listener in &self.config.listeners {
            listener.state_changed(from, to);
        }
    }

    fn current_state(&self) -> CircuitState {
        let now = self.config.clock.now_millis();
        let (state, transition) = {
            let mut s = self.lock();
            let transition = self.maybe_half_open(&mut s, now);
            (s.state, transition)
        };
        if let Some(transition) = transition {
            self.announce(transition, 0);
        }
        state
    }

    fn reset(&self) {
        let transition = {
            let mut s = self.lock();
            let from = s.state;
            self.to_closed(&mut s);
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        tracing::info!(breaker = self.label(), "circuit breaker reset");
        if let Some(transition) = transition {
            self.announce(transition, 0);
        }
    }
}

/// Releases a half-open probe slot if the probe is dropped before it settles.
struct ProbeSlot<'a> {
    core: &'a BreakerCore,
    generation: u64,
    armed: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.core.release_probe(self.generation);
        }
    }
}

/// Handle to reset/query a circuit breaker instance.
#[derive(Clone)]
pub struct CircuitBreakerHandle {
    core: Arc<BreakerCore>,
}

impl fmt::Debug for CircuitBreakerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerHandle")
            .field("name", &self.core.config.name)
            .field("state", &self.core.lock().state)
            .finish()
    }
}

impl CircuitBreakerHandle {
    /// Current breaker state. An open breaker whose delay has elapsed reports half-open.
    pub fn state(&self) -> CircuitState {
        self.core.current_state()
    }

    /// Force the breaker closed with an empty window.
    pub fn reset(&self) {
        self.core.reset();
    }

    pub fn name(&self) -> Option<&str> {
        self.core.config.name()
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.core.config
    }

    /// Whether two handles control the same breaker.
    pub fn same_breaker(&self, other: &CircuitBreakerHandle) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

/// Circuit breaker strategy around a delegate.
pub struct CircuitBreaker<V> {
    delegate: SharedStrategy<V>,
    core: Arc<BreakerCore>,
}

impl<V> fmt::Debug for CircuitBreaker<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker").field("config", &self.core.config).finish()
    }
}

impl<V: Send + 'static> CircuitBreaker<V> {
    pub fn new(delegate: SharedStrategy<V>, config: CircuitBreakerConfig) -> Self {
        Self { delegate, core: Arc::new(BreakerCore::new(config)) }
    }

    /// Maintenance handle sharing this breaker's state.
    pub fn handle(&self) -> CircuitBreakerHandle {
        CircuitBreakerHandle { core: self.core.clone() }
    }

    pub fn state(&self) -> CircuitState {
        self.core.current_state()
    }
}

#[async_trait]
impl<V: Send + 'static> Strategy<V> for CircuitBreaker<V> {
    async fn apply(&self, ctx: &Arc<InvocationContext<V>>) -> Result<V, ResilienceError> {
        let core = &*self.core;
        let (generation, probe) = match core.admit() {
            Admission::Closed { generation } => (generation, false),
            Admission::Probe { generation } => (generation, true),
            Admission::Rejected { half_open, open_for } => {
                return Err(ResilienceError::CircuitOpen { half_open, open_for });
            }
        };
        let mut slot = ProbeSlot { core, generation, armed: probe };

        let result = self.delegate.apply(ctx).await;
        slot.armed = false;
        drop(slot);

        match &result {
            Ok(_) => core.record(generation, probe, true),
            Err(error) if error.is_cancelled() => {
                if probe {
                    core.release_probe(generation);
                }
            }
            Err(error) => core.record(generation, probe, core.config.decision.is_expected(error)),
        }
        result
    }
}
