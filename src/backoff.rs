//! Backoff strategies for retry policies.
//!
//! Provides constant, exponential, fibonacci, and custom strategies with optional caps. Attempt
//! semantics: attempt index `0` represents the initial call (no delay), and retries start at
//! `attempt = 1`. Delays saturate at a documented maximum to avoid overflow.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use faultguard::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(0)); // initial call
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//!
//! let fib = Backoff::fibonacci(Duration::from_millis(10));
//! assert_eq!(fib.delay(4), Duration::from_millis(50)); // 10, 20, 30, 50
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day). Attempts
//! greater than `u32::MAX` are clamped when computing multipliers.
//!
//! Custom strategies are stateful and see the failure that triggered each retry, so a retry
//! asks the backoff for a fresh [`BackoffSequence`] per invocation instead of calling
//! [`Backoff::delay`].

use crate::error::ResilienceError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("with_max is only valid for exponential or fibonacci backoff, not {0}")]
    MaxNotSupported(&'static str),
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
    #[error("exponential factor must be at least 1, got {0}")]
    InvalidFactor(u32),
}

/// User-supplied backoff. One instance is created per retried invocation.
pub trait CustomBackoff: Send {
    /// Called once, before the first retry, with the configured initial delay.
    fn init(&mut self, initial: Duration);

    /// Delay before the next retry. `failure` is the error the last attempt raised, or `None`
    /// when the retry was triggered by a rejected result value.
    fn next_delay(&mut self, failure: Option<&ResilienceError>) -> Duration;
}

type CustomFactory = Arc<dyn Fn() -> Box<dyn CustomBackoff> + Send + Sync>;

#[derive(Clone)]
enum BackoffKind {
    Constant { delay: Duration },
    Exponential { base: Duration, factor: u32, max: Option<Duration> },
    Fibonacci { base: Duration, max: Option<Duration> },
    Custom { base: Duration, factory: CustomFactory },
}

impl fmt::Debug for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant { delay } => f.debug_struct("Constant").field("delay", delay).finish(),
            Self::Exponential { base, factor, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("factor", factor)
                .field("max", max)
                .finish(),
            Self::Fibonacci { base, max } => {
                f.debug_struct("Fibonacci").field("base", base).field("max", max).finish()
            }
            Self::Custom { base, .. } => f.debug_struct("Custom").field("base", base).finish(),
        }
    }
}

fn saturating_nanos(nanos: u128) -> Duration {
    Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64)
}

fn cap(delay: Duration, max: Option<Duration>) -> Duration {
    max.map(|m| delay.min(m)).unwrap_or(delay).min(MAX_BACKOFF)
}

fn exponential_delay(base: Duration, factor: u32, max: Option<Duration>, attempt: usize) -> Duration {
    let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
    let multiplier = u128::from(factor).saturating_pow(exponent);
    cap(saturating_nanos(base.as_nanos().saturating_mul(multiplier)), max)
}

fn fibonacci_delay(base: Duration, max: Option<Duration>, attempt: usize) -> Duration {
    let limit = cap(MAX_BACKOFF, max).as_nanos();
    let mut a = base.as_nanos();
    let mut b = a.saturating_mul(2);
    if attempt == 1 || a == 0 {
        return cap(saturating_nanos(a), max);
    }
    for _ in 2..attempt {
        if b >= limit {
            break;
        }
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    cap(saturating_nanos(b), max)
}

/// Backoff strategy descriptor; immutable and shareable.
#[derive(Debug, Clone)]
pub struct Backoff {
    kind: BackoffKind,
}

impl Backoff {
    /// Create a constant backoff strategy
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant { delay } }
    }

    /// Create an exponential backoff strategy doubling each retry
    pub fn exponential(base: Duration) -> Self {
        Self { kind: BackoffKind::Exponential { base, factor: 2, max: None } }
    }

    /// Create a fibonacci backoff strategy: `base, 2*base, 3*base, 5*base, 8*base, ...`
    pub fn fibonacci(base: Duration) -> Self {
        Self { kind: BackoffKind::Fibonacci { base, max: None } }
    }

    /// Create a backoff driven by a user-supplied strategy object.
    pub fn custom<F, B>(base: Duration, factory: F) -> Self
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: CustomBackoff + 'static,
    {
        let factory: CustomFactory = Arc::new(move || Box::new(factory()) as Box<dyn CustomBackoff>);
        Self { kind: BackoffKind::Custom { base, factory } }
    }

    /// Multiplier applied per retry by an exponential backoff.
    pub fn with_factor(mut self, factor: u32) -> Result<Self, BackoffError> {
        if factor == 0 {
            return Err(BackoffError::InvalidFactor(factor));
        }
        if let BackoffKind::Exponential { factor: existing, .. } = &mut self.kind {
            *existing = factor;
        }
        Ok(self)
    }

    /// Set a maximum delay for the backoff (exponential or fibonacci).
    /// Returns an error for other kinds, if `max` is zero, or if `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.kind {
            BackoffKind::Exponential { base, max: existing, .. }
            | BackoffKind::Fibonacci { base, max: existing } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            BackoffKind::Constant { .. } => Err(BackoffError::MaxNotSupported("constant")),
            BackoffKind::Custom { .. } => Err(BackoffError::MaxNotSupported("custom")),
        }
    }

    /// Initial (or constant) delay.
    pub fn base(&self) -> Duration {
        match &self.kind {
            BackoffKind::Constant { delay } => *delay,
            BackoffKind::Exponential { base, .. }
            | BackoffKind::Fibonacci { base, .. }
            | BackoffKind::Custom { base, .. } => *base,
        }
    }

    /// Upper bound on any delay this backoff can produce, if one is configured.
    pub fn max(&self) -> Option<Duration> {
        match &self.kind {
            BackoffKind::Constant { delay } => Some(*delay),
            BackoffKind::Exponential { max, .. } | BackoffKind::Fibonacci { max, .. } => *max,
            BackoffKind::Custom { .. } => None,
        }
    }

    /// Calculate the delay for a given attempt number (0-based; 0 = initial call, no delay).
    ///
    /// Custom backoffs are stateful; for them this returns the base delay. Use [`Self::start`].
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match &self.kind {
            BackoffKind::Constant { delay } => *delay,
            BackoffKind::Exponential { base, factor, max } => {
                exponential_delay(*base, *factor, *max, attempt)
            }
            BackoffKind::Fibonacci { base, max } => fibonacci_delay(*base, *max, attempt),
            BackoffKind::Custom { base, .. } => *base,
        }
    }

    /// Per-invocation delay sequence.
    pub fn start(&self) -> BackoffSequence {
        let custom = match &self.kind {
            BackoffKind::Custom { base, factory } => {
                let mut custom = factory();
                custom.init(*base);
                Some(custom)
            }
            _ => None,
        };
        BackoffSequence { backoff: self.clone(), attempt: 0, custom }
    }
}

/// Delays for the retries of one invocation, in order.
pub struct BackoffSequence {
    backoff: Backoff,
    attempt: usize,
    custom: Option<Box<dyn CustomBackoff>>,
}

impl fmt::Debug for BackoffSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffSequence")
            .field("backoff", &self.backoff)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl BackoffSequence {
    /// Delay before the next retry.
    pub fn next_delay(&mut self, failure: Option<&ResilienceError>) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        match self.custom.as_mut() {
            Some(custom) => custom.next_delay(failure).min(MAX_BACKOFF),
            None => self.backoff.delay(self.attempt),
        }
    }

    /// Retries handed out so far.
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}
