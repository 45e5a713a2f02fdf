//! Rate limiting primitives.
//!
//! This module provides the building blocks for rate limiting:
//! - [`RateLimiter`]: The core trait for admission logic.
//! - [`WindowLimiter`]: the in-memory limiter driven by one of the [`windows`].
//! - [`RateLimit`]: the strategy that asks a limiter before delegating.
//! - [`Decision`]: The result of a rate limit check (Allowed/Denied).
//!
//! # Architecture
//!
//! - **Strategy**: `RateLimit` wraps a delegate. It doesn't know *how* limiting works,
//!   only that it should ask a `RateLimiter`. A denied call never reaches the delegate and fails
//!   with [`ResilienceError::RateLimited`].
//! - **Logic**: [`FixedWindow`], [`RollingWindow`] and [`SmoothWindow`] handle the accounting,
//!   each optionally enforcing a minimum spacing between admissions.
//!
//! Admission is independent of the call's outcome.

use crate::clock::{Clock, MonotonicClock};
use crate::context::InvocationContext;
use crate::error::ResilienceError;
use crate::strategy::{SharedStrategy, Strategy};
use crate::telemetry::{EventSink, NullSink, PolicyEvent, RateLimitEvent, SharedSink};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub mod windows;
pub use windows::{FixedWindow, RollingWindow, SmoothWindow, TimeWindow};

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed {
        /// Number of permits remaining after this acquisition.
        remaining: u32,
    },
    /// The request is denied.
    Denied {
        /// How long the caller should wait before retrying.
        wait: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Core interface for rate limiting logic.
///
/// Implementations must be safe under concurrent admission checks.
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Decide on one call, consuming a permit when it is allowed.
    fn acquire(&self) -> Decision;
}

/// Window algorithm used by a [`WindowLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitType {
    /// Permits refill all at once at each window boundary.
    #[default]
    Fixed,
    /// Admissions are counted over the last `window` ending now.
    Rolling,
    /// Permits accrue evenly across the window.
    Smooth,
}

/// Errors produced when validating rate limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitConfigError {
    #[error("limit must be > 0")]
    ZeroLimit,
    #[error("window must be at least 1ms")]
    ZeroWindow,
}

/// Validated rate limit configuration.
#[derive(Clone)]
pub struct RateLimitConfig {
    limit: u32,
    window: Duration,
    min_spacing: Duration,
    kind: RateLimitType,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
}

impl fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("min_spacing", &self.min_spacing)
            .field("kind", &self.kind)
            .finish()
    }
}

impl RateLimitConfig {
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    pub fn kind(&self) -> RateLimitType {
        self.kind
    }
}

/// Builder for [`RateLimitConfig`]. Defaults to 100 calls per second in a fixed window.
pub struct RateLimitConfigBuilder {
    limit: u32,
    window: Duration,
    min_spacing: Duration,
    kind: RateLimitType,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
}

impl Default for RateLimitConfigBuilder {
    fn default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(1),
            min_spacing: Duration::ZERO,
            kind: RateLimitType::Fixed,
            clock: Arc::new(MonotonicClock::default()),
            sink: Arc::new(NullSink),
        }
    }
}

impl RateLimitConfigBuilder {
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn min_spacing(mut self, spacing: Duration) -> Self {
        self.min_spacing = spacing;
        self
    }

    pub fn kind(mut self, kind: RateLimitType) -> Self {
        self.kind = kind;
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

    pub fn build(self) -> Result<RateLimitConfig, RateLimitConfigError> {
        if self.limit == 0 {
            return Err(RateLimitConfigError::ZeroLimit);
        }
        if self.window.as_millis() == 0 {
            return Err(RateLimitConfigError::ZeroWindow);
        }
        Ok(RateLimitConfig {
            limit: self.limit,
            window: self.window,
            min_spacing: self.min_spacing,
            kind: self.kind,
            clock: self.clock,
            sink: self.sink,
        })
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// In-memory limiter: a [`TimeWindow`] behind a mutex, timed by a [`Clock`].
pub struct WindowLimiter {
    window: Mutex<Box<dyn TimeWindow>>,
    clock: Arc<dyn Clock>,
    origin: u64,
    config: RateLimitConfig,
}

impl fmt::Debug for WindowLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowLimiter").field("config", &self.config).finish()
    }
}

impl WindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let clock = config.clock.clone();
        let origin = clock.now_millis();
        Self { window: Mutex::new(Self::fresh_window(&config)), clock, origin, config }
    }

    fn fresh_window(config: &RateLimitConfig) -> Box<dyn TimeWindow> {
        let (limit, window, spacing) = (config.limit, millis(config.window), millis(config.min_spacing));
        match config.kind {
            RateLimitType::Fixed => Box::new(FixedWindow::new(limit, window, spacing)),
            RateLimitType::Rolling => Box::new(RollingWindow::new(limit, window, spacing)),
            RateLimitType::Smooth => Box::new(SmoothWindow::new(limit, window, spacing)),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Forget every admission; the limiter behaves as if it had just started.
    pub fn reset(&self) {
        // windows count time from their own start
        let elapsed = self.clock.now_millis().saturating_sub(self.origin);
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        *window = Box::new(Shifted { inner: Self::fresh_window(&self.config), offset: elapsed });
    }
}

/// A window that started `offset` ms after the limiter's origin.
#[derive(Debug)]
struct Shifted {
    inner: Box<dyn TimeWindow>,
    offset: u64,
}

impl TimeWindow for Shifted {
    fn record(&mut self, now: u64) -> Decision {
        self.inner.record(now.saturating_sub(self.offset))
    }
}

impl RateLimiter for WindowLimiter {
    fn acquire(&self) -> Decision {
        let now = self.clock.now_millis().saturating_sub(self.origin);
        self.window.lock().unwrap_or_else(PoisonError::into_inner).record(now)
    }
}

/// Rate limiting strategy around a delegate.
pub struct RateLimit<V> {
    delegate: SharedStrategy<V>,
    limiter: Arc<dyn RateLimiter>,
    sink: SharedSink,
}

impl<V> fmt::Debug for RateLimit<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimit").field("limiter", &self.limiter).finish()
    }
}

impl<V: Send + 'static> RateLimit<V> {
    pub fn new(delegate: SharedStrategy<V>, config: RateLimitConfig) -> Self {
        let sink = config.sink.clone();
        Self { delegate, limiter: Arc::new(WindowLimiter::new(config)), sink }
    }

    /// Use a custom limiter implementation.
    pub fn with_limiter(delegate: SharedStrategy<V>, limiter: Arc<dyn RateLimiter>) -> Self {
        Self { delegate, limiter, sink: Arc::new(NullSink) }
    }

    pub fn with_sink<S: EventSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }
}

#[async_trait]
impl<V: Send + 'static> Strategy<V> for RateLimit<V> {
    async fn apply(&self, ctx: &Arc<InvocationContext<V>>) -> Result<V, ResilienceError> {
        match self.limiter.acquire() {
            Decision::Allowed { remaining } => {
                tracing::trace!(remaining, "rate limit permitted");
                self.sink.record(&PolicyEvent::RateLimit(RateLimitEvent::Permitted));
                self.delegate.apply(ctx).await
            }
            Decision::Denied { wait } => {
                tracing::debug!(retry_after = ?wait, "rate limit exceeded");
                self.sink.record(&PolicyEvent::RateLimit(RateLimitEvent::Rejected { retry_after: wait }));
                Err(ResilienceError::RateLimited { retry_after: wait })
            }
        }
    }
}
