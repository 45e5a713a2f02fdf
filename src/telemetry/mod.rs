//! Telemetry for resilience strategies.
//!
//! Strategies report every observable decision as a [`PolicyEvent`] to an [`EventSink`]. The
//! sink is the metrics collaborator: the library only describes what happened, sinks decide
//! whether to log, aggregate, or export it.
//!
//! # Event Types
//!
//! - **Retry**: `Attempt`, `Succeeded`, `NotRetried`, `Exhausted`
//! - **Circuit Breaker**: `Opened`, `HalfOpen`, `Closed`, `Succeeded`, `Failed`, `Rejected`
//! - **Bulkhead**: `Acquired`, `Queued`, `Rejected`, `Released`, `Abandoned`
//! - **Timeout**: `Occurred`, `Completed`
//! - **Rate Limit**: `Permitted`, `Rejected`
//! - **Fallback**: `Applied`, `Skipped`
//! - **Guard**: `Request` success/failure around the whole chain

pub mod events;
pub mod sinks;

pub use events::{
    BulkheadEvent, CircuitBreakerEvent, FallbackEvent, PolicyEvent, RateLimitEvent,
    RequestOutcome, RetryEvent, TimeoutEvent,
};
pub use sinks::{EventSink, FanoutSink, LogSink, MemorySink, NullSink, SharedSink};
