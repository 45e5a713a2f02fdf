//! Error types for resilience strategies
//!
//! Callers of a guarded call observe exactly one error type, [`ResilienceError`]. Errors raised
//! by the guarded call itself travel inside [`ResilienceError::Inner`] as a [`BoxError`]; every
//! other variant is generated by a strategy and can be told apart with the `is_*` predicates or
//! [`ResilienceError::kind`].
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Type-erased error raised by a guarded call.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Discriminant for strategy-generated errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A timeout strategy gave up waiting.
    Timeout,
    /// A bulkhead refused admission.
    Bulkhead,
    /// A circuit breaker refused the call while open (or half-open at probe capacity).
    CircuitOpen,
    /// A retry strategy ran out of attempts or time.
    RetryExhausted,
    /// A rate limiter refused admission.
    RateLimited,
    /// The invocation was cancelled before it produced a result.
    Cancelled,
}

/// Unified error type for all resilience strategies
#[derive(Debug)]
pub enum ResilienceError {
    /// The operation exceeded the timeout duration
    Timeout { elapsed: Duration, timeout: Duration },
    /// The bulkhead rejected the operation due to capacity
    Bulkhead { in_flight: usize, max: usize },
    /// The circuit breaker is open
    CircuitOpen { half_open: bool, open_for: Duration },
    /// Retries were exhausted; `last` holds the most recent failure, if the last attempt failed
    /// with an error rather than a value the retry predicate rejected.
    RetryExhausted { attempts: usize, last: Option<Box<ResilienceError>> },
    /// The rate limiter rejected the operation
    RateLimited { retry_after: Duration },
    /// The invocation was cancelled
    Cancelled,
    /// The underlying operation failed
    Inner(BoxError),
}

impl fmt::Display for ResilienceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::Bulkhead { in_flight, max } => {
                write!(f, "bulkhead rejected request ({} in-flight, max {})", in_flight, max)
            }
            Self::CircuitOpen { half_open, open_for } => {
                if *half_open {
                    write!(f, "circuit breaker half-open, probe capacity exhausted")
                } else {
                    write!(f, "circuit breaker open (open for {:?})", open_for)
                }
            }
            Self::RetryExhausted { attempts, last } => match last {
                Some(last) => {
                    write!(f, "retry exhausted after {} attempts; last error: {}", attempts, last)
                }
                None => write!(f, "retry exhausted after {} attempts; no recorded failure", attempts),
            },
            Self::RateLimited { retry_after } => {
                write!(f, "rate limit exceeded (retry after {:?})", retry_after)
            }
            Self::Cancelled => write!(f, "invocation cancelled"),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl Error for ResilienceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Inner(e) => Some(&**e),
            Self::RetryExhausted { last, .. } => last.as_deref().map(ResilienceError::as_error),
            _ => None,
        }
    }
}

impl From<BoxError> for ResilienceError {
    fn from(error: BoxError) -> Self {
        Self::from_boxed(error)
    }
}

impl ResilienceError {
    /// Wrap an error raised by the guarded call.
    pub fn inner<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::from_boxed(error.into())
    }

    /// Recover a `ResilienceError` that crossed a type-erased boundary (a nested guard, an async
    /// handle); anything else becomes `Inner`.
    pub fn from_boxed(error: BoxError) -> Self {
        match error.downcast::<ResilienceError>() {
            Ok(resilience) => *resilience,
            Err(other) => Self::Inner(other),
        }
    }

    /// The error as seen by matchers: the wrapped error for `Inner`, `self` otherwise.
    pub fn as_error(&self) -> &(dyn Error + 'static) {
        match self {
            Self::Inner(e) => &**e,
            other => other,
        }
    }

    /// Strategy-generated kind, `None` for errors raised by the guarded call.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Timeout { .. } => Some(ErrorKind::Timeout),
            Self::Bulkhead { .. } => Some(ErrorKind::Bulkhead),
            Self::CircuitOpen { .. } => Some(ErrorKind::CircuitOpen),
            Self::RetryExhausted { .. } => Some(ErrorKind::RetryExhausted),
            Self::RateLimited { .. } => Some(ErrorKind::RateLimited),
            Self::Cancelled => Some(ErrorKind::Cancelled),
            Self::Inner(_) => None,
        }
    }

    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is due to bulkhead rejection
    pub fn is_bulkhead(&self) -> bool {
        matches!(self, Self::Bulkhead { .. })
    }

    /// Check if this error is due to retry exhaustion
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Check if this error is due to rate limiting
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if the invocation was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<BoxError> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            Self::Inner(e) => Some(&**e),
            _ => None,
        }
    }

    /// Downcast the inner error to a concrete type.
    pub fn downcast_inner<T: Error + 'static>(&self) -> Option<&T> {
        self.as_inner().and_then(|e| e.downcast_ref::<T>())
    }

    /// Last failure recorded by an exhausted retry.
    pub fn last_failure(&self) -> Option<&ResilienceError> {
        match self {
            Self::RetryExhausted { last, .. } => last.as_deref(),
            _ => None,
        }
    }

    /// Access timeout details as (elapsed, limit).
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }

    /// Access bulkhead capacity info as (in_flight, max).
    pub fn bulkhead_capacity(&self) -> Option<(usize, usize)> {
        match self {
            Self::Bulkhead { in_flight, max } => Some((*in_flight, *max)),
            _ => None,
        }
    }

    /// How long a rate-limited caller should wait before trying again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
