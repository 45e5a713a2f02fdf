use std::fmt;
use std::time::Duration;

/// Policy events emitted during execution.
///
/// Every strategy reports what it observed through these events: admission decisions, outcomes,
/// state transitions, and the durations involved. Sinks aggregate or forward them.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    /// Retry policy events
    Retry(RetryEvent),
    /// Circuit breaker events
    CircuitBreaker(CircuitBreakerEvent),
    /// Bulkhead events
    Bulkhead(BulkheadEvent),
    /// Timeout events
    Timeout(TimeoutEvent),
    /// Rate limiter events
    RateLimit(RateLimitEvent),
    /// Fallback events
    Fallback(FallbackEvent),
    /// Request outcome events (emitted by a guard around the whole chain)
    Request(RequestOutcome),
}

/// Events emitted by retry policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry attempt is about to be made.
    ///
    /// Emitted before sleeping and retrying a failed request.
    Attempt {
        /// The retry number (1-indexed; the initial call is not a retry)
        attempt: usize,
        /// The backoff delay before this retry
        delay: Duration,
    },
    /// The call eventually produced an accepted result.
    Succeeded {
        /// Total number of calls made, including the initial one
        total_attempts: usize,
    },
    /// The outcome was not retryable and was passed through as-is.
    NotRetried {
        /// Total number of calls made
        total_attempts: usize,
    },
    /// All retry attempts have been exhausted.
    ///
    /// Emitted when the maximum number of retries or the max duration is reached and the
    /// request still fails.
    Exhausted {
        /// Total number of attempts made
        total_attempts: usize,
        /// Total time spent retrying
        total_duration: Duration,
    },
}

/// Events emitted by circuit breaker policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Circuit transitioned to open state.
    ///
    /// Subsequent requests will be rejected immediately without
    /// being forwarded to the inner service.
    Opened {
        /// Failures in the rolling window (or 1 for a failed probe)
        failure_count: usize,
        /// Outcomes in the rolling window when it tripped
        window_size: usize,
    },
    /// Circuit transitioned to half-open state.
    ///
    /// A limited number of test requests will be allowed through
    /// to determine if the inner service has recovered.
    HalfOpen,
    /// Circuit transitioned to closed state.
    ///
    /// Normal operation resumes - all requests are forwarded.
    Closed,
    /// A delegated call was recorded as a success.
    Succeeded,
    /// A delegated call was recorded as a failure.
    Failed,
    /// A call was refused without being delegated.
    Rejected {
        /// `true` when refused because half-open probe capacity was exhausted
        half_open: bool,
    },
}

/// Events emitted by bulkhead policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadEvent {
    /// A request successfully acquired a bulkhead permit.
    ///
    /// The request will proceed to the inner service.
    Acquired {
        /// Current number of active requests
        active_count: usize,
        /// Maximum concurrency limit
        max_concurrency: usize,
        /// Time spent queued before the permit was granted
        waited: Duration,
    },
    /// No permit was free; the request joined the wait queue.
    Queued {
        /// Requests waiting, this one included
        waiting: usize,
        /// Maximum queue size
        queue_size: usize,
    },
    /// A request was rejected due to bulkhead saturation.
    ///
    /// All available permits are in use and the queue is full.
    Rejected {
        /// Current number of active requests
        active_count: usize,
        /// Maximum concurrency limit
        max_concurrency: usize,
    },
    /// A running request released its permit.
    Released {
        /// Time the request held the permit
        ran: Duration,
    },
    /// A queued request was cancelled before it acquired a permit.
    Abandoned {
        /// Time spent queued
        waited: Duration,
    },
}

/// Events emitted by timeout policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    /// A request exceeded the timeout duration.
    ///
    /// The request was cancelled and an error returned.
    Occurred {
        /// The timeout duration that was exceeded
        timeout: Duration,
    },
    /// A request finished within the timeout.
    Completed {
        /// Time taken to complete the request
        elapsed: Duration,
    },
}

/// Events emitted by rate limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// The request was admitted.
    Permitted,
    /// The request was refused without being delegated.
    Rejected {
        /// Wait before the next admission may succeed
        retry_after: Duration,
    },
}

/// Events emitted by fallback policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackEvent {
    /// The fallback handler replaced a failure.
    Applied,
    /// The failure did not match and was propagated.
    Skipped,
}

/// Request outcome events emitted around a whole chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Request completed successfully.
    Success {
        /// Time taken to complete the request
        duration: Duration,
    },
    /// Request failed with an error.
    Failure {
        /// Time taken before failure
        duration: Duration,
    },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Retry(event) => write!(f, "Retry::{}", event),
            PolicyEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            PolicyEvent::Bulkhead(event) => write!(f, "Bulkhead::{}", event),
            PolicyEvent::Timeout(event) => write!(f, "Timeout::{}", event),
            PolicyEvent::RateLimit(event) => write!(f, "RateLimit::{}", event),
            PolicyEvent::Fallback(event) => write!(f, "Fallback::{}", event),
            PolicyEvent::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => {
                write!(f, "Attempt(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Succeeded { total_attempts } => {
                write!(f, "Succeeded(attempts={})", total_attempts)
            }
            RetryEvent::NotRetried { total_attempts } => {
                write!(f, "NotRetried(attempts={})", total_attempts)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { failure_count, window_size } => {
                write!(f, "Opened(failures={}/{})", failure_count, window_size)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
            CircuitBreakerEvent::Succeeded => write!(f, "Succeeded"),
            CircuitBreakerEvent::Failed => write!(f, "Failed"),
            CircuitBreakerEvent::Rejected { half_open } => {
                write!(f, "Rejected(half_open={})", half_open)
            }
        }
    }
}

impl fmt::Display for BulkheadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkheadEvent::Acquired { active_count, max_concurrency, waited } => {
                write!(f, "Acquired({}/{}, waited={:?})", active_count, max_concurrency, waited)
            }
            BulkheadEvent::Queued { waiting, queue_size } => {
                write!(f, "Queued({}/{})", waiting, queue_size)
            }
            BulkheadEvent::Rejected { active_count, max_concurrency } => {
                write!(f, "Rejected({}/{})", active_count, max_concurrency)
            }
            BulkheadEvent::Released { ran } => write!(f, "Released(ran={:?})", ran),
            BulkheadEvent::Abandoned { waited } => write!(f, "Abandoned(waited={:?})", waited),
        }
    }
}

impl fmt::Display for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutEvent::Occurred { timeout } => write!(f, "Occurred(timeout={:?})", timeout),
            TimeoutEvent::Completed { elapsed } => write!(f, "Completed(elapsed={:?})", elapsed),
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Permitted => write!(f, "Permitted"),
            RateLimitEvent::Rejected { retry_after } => {
                write!(f, "Rejected(retry_after={:?})", retry_after)
            }
        }
    }
}

impl fmt::Display for FallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackEvent::Applied => write!(f, "Applied"),
            FallbackEvent::Skipped => write!(f, "Skipped"),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { duration } => write!(f, "Success(duration={:?})", duration),
            RequestOutcome::Failure { duration } => write!(f, "Failure(duration={:?})", duration),
        }
    }
}
