//! Bulkhead implementation for concurrency limiting
//!
//! Admission happens in two steps. A call first takes one of `max_concurrent + queue_size`
//! admission permits without waiting; if none is free the call is rejected immediately. It then
//! waits, in FIFO order, for one of `max_concurrent` execution permits. With a queue size of 0 the
//! second step never waits, which gives the plain semaphore bulkhead.
//!
//! A queued call that is cancelled (its future dropped, or `CANCEL` fired on its context) leaves
//! the queue without running the delegate. Both permits are released on every exit path.

use crate::clock::{Clock, MonotonicClock, Stopwatch};
use crate::context::InvocationContext;
use crate::error::ResilienceError;
use crate::strategy::{SharedStrategy, Strategy};
use crate::telemetry::{BulkheadEvent, EventSink, NullSink, PolicyEvent, SharedSink};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Errors produced when validating bulkhead configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BulkheadConfigError {
    #[error("max_concurrent must be > 0")]
    ZeroCapacity,
    #[error("max_concurrent + queue_size exceeds the semaphore limit ({0})")]
    TooLarge(usize),
}

/// Validated bulkhead configuration.
#[derive(Clone)]
pub struct BulkheadConfig {
    max_concurrent: usize,
    queue_size: usize,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
}

impl fmt::Debug for BulkheadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadConfig")
            .field("max_concurrent", &self.max_concurrent)
            .field("queue_size", &self.queue_size)
            .finish()
    }
}

impl BulkheadConfig {
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::default()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }
}

/// Builder for [`BulkheadConfig`]. Defaults to 10 concurrent calls and 10 queued.
pub struct BulkheadConfigBuilder {
    max_concurrent: usize,
    queue_size: usize,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
}

impl Default for BulkheadConfigBuilder {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_size: 10,
            clock: Arc::new(MonotonicClock::default()),
            sink: Arc::new(NullSink),
        }
    }
}

impl BulkheadConfigBuilder {
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    /// Calls allowed to wait for a permit; 0 rejects as soon as all permits are taken.
    pub fn queue_size(mut self, n: usize) -> Self {
        self.queue_size = n;
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

    pub fn build(self) -> Result<BulkheadConfig, BulkheadConfigError> {
        if self.max_concurrent == 0 {
            return Err(BulkheadConfigError::ZeroCapacity);
        }
        match self.max_concurrent.checked_add(self.queue_size) {
            Some(total) if total <= Semaphore::MAX_PERMITS => {}
            _ => return Err(BulkheadConfigError::TooLarge(Semaphore::MAX_PERMITS)),
        }
        Ok(BulkheadConfig {
            max_concurrent: self.max_concurrent,
            queue_size: self.queue_size,
            clock: self.clock,
            sink: self.sink,
        })
    }
}

/// Decrements a counter when dropped.
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn enter(counter: &'a AtomicUsize) -> (Self, usize) {
        let now = counter.fetch_add(1, Ordering::AcqRel) + 1;
        (Self(counter), now)
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Concurrency-limiting strategy.
pub struct Bulkhead<V> {
    delegate: SharedStrategy<V>,
    config: BulkheadConfig,
    admission: Arc<Semaphore>,
    execution: Arc<Semaphore>,
    running: AtomicUsize,
    waiting: AtomicUsize,
}

impl<V> fmt::Debug for Bulkhead<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("config", &self.config)
            .field("running", &self.running())
            .field("waiting", &self.waiting())
            .finish()
    }
}

impl<V> Bulkhead<V> {
    /// Calls currently executing the delegate.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Calls currently queued for an execution permit.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    fn record(&self, event: BulkheadEvent) {
        self.config.sink.record(&PolicyEvent::Bulkhead(event));
    }
}

impl<V: Send + 'static> Bulkhead<V> {
    pub fn new(delegate: SharedStrategy<V>, config: BulkheadConfig) -> Self {
        let total = config.max_concurrent + config.queue_size;
        Self {
            delegate,
            admission: Arc::new(Semaphore::new(total)),
            execution: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            running: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl<V: Send + 'static> Strategy<V> for Bulkhead<V> {
    async fn apply(&self, ctx: &Arc<InvocationContext<V>>) -> Result<V, ResilienceError> {
        let max = self.config.max_concurrent;
        let _admitted = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let in_flight = self.running();
                tracing::debug!(in_flight, max, queued = self.waiting(), "bulkhead rejected");
                self.record(BulkheadEvent::Rejected { active_count: in_flight, max_concurrency: max });
                return Err(ResilienceError::Bulkhead { in_flight, max });
            }
        };

        let queued = Stopwatch::start(self.config.clock.clone());
        let _executing = match self.execution.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let (waiting, now_waiting) = Gauge::enter(&self.waiting);
                self.record(BulkheadEvent::Queued {
                    waiting: now_waiting,
                    queue_size: self.config.queue_size,
                });
                tracing::trace!(waiting = now_waiting, "bulkhead queued");
                let acquired = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => None,
                    permit = self.execution.clone().acquire_owned() => permit.ok(),
                };
                drop(waiting);
                match acquired {
                    Some(permit) => permit,
                    None => {
                        self.record(BulkheadEvent::Abandoned { waited: queued.elapsed() });
                        return Err(ResilienceError::Cancelled);
                    }
                }
            }
        };

        let (running, active) = Gauge::enter(&self.running);
        self.record(BulkheadEvent::Acquired {
            active_count: active,
            max_concurrency: max,
            waited: queued.elapsed(),
        });
        let ran = Stopwatch::start(self.config.clock.clone());
        let result = self.delegate.apply(ctx).await;
        drop(running);
        self.record(BulkheadEvent::Released { ran: ran.elapsed() });
        result
    }
}
