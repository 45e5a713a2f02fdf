//! Per-invocation context shared by every strategy in one chain.
//!
//! The context owns the guarded call and a small event bus. Strategies use the bus for
//! out-of-band signalling: a timeout fires [`InvocationEvent::Timeout`] when its deadline
//! passes, and dropping or cancelling the outer call fires [`InvocationEvent::Cancel`]. Whoever
//! owns the execution substrate (see [`crate::offload`]) registers handlers that turn those
//! events into a best-effort interruption of in-flight work.
//!
//! Firing is a synchronous broadcast to the handlers registered at that moment; a handler
//! registered later does not see earlier events. Handlers must not panic and may run
//! concurrently with the guarded call completing normally.
use crate::error::{BoxError, ResilienceError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

/// A value that will be available later: the canonical async result every strategy works with.
pub type Deferred<V> = BoxFuture<'static, Result<V, ResilienceError>>;

/// The guarded call: invoked once per attempt, producing a fresh [`Deferred`] each time.
pub type GuardedCall<V> = Arc<dyn Fn() -> Deferred<V> + Send + Sync>;

type Handler = Arc<dyn Fn() + Send + Sync>;

/// Identifies one registration made with [`InvocationContext::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Events strategies can broadcast on a shared context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationEvent {
    /// The caller no longer wants the result.
    Cancel,
    /// A timeout strategy's deadline elapsed.
    Timeout,
}

/// Guarded call plus event bus for one external invocation.
pub struct InvocationContext<V> {
    call: GuardedCall<V>,
    handlers: Mutex<HashMap<InvocationEvent, Vec<(HandlerId, Handler)>>>,
    next_handler: AtomicU64,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl<V> fmt::Debug for InvocationContext<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("cancelled", &self.is_cancelled())
            .field("call", &"<guarded call>")
            .finish()
    }
}

impl<V: Send + 'static> InvocationContext<V> {
    /// Context around an async guarded call.
    pub fn new<F, Fut, E>(call: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self::from_deferred(move || call().map(|r| r.map_err(ResilienceError::inner)).boxed())
    }

    /// Context around a synchronous guarded call, executed on tokio's blocking pool so that a
    /// timeout can give up on it. A call that is abandoned keeps running to completion on its
    /// thread; its result is discarded.
    pub fn blocking<F, E>(call: F) -> Self
    where
        F: Fn() -> Result<V, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let call = Arc::new(call);
        Self::from_deferred(move || {
            let call = call.clone();
            async move {
                // the error type need not be `Send`; box it before leaving the blocking thread
                match tokio::task::spawn_blocking(move || call().map_err(Into::<BoxError>::into)).await {
                    Ok(result) => result.map_err(ResilienceError::from_boxed),
                    Err(join) if join.is_cancelled() => Err(ResilienceError::Cancelled),
                    Err(join) => Err(ResilienceError::inner(join)),
                }
            }
            .boxed()
        })
    }

    /// Context around a call that already speaks the canonical deferred type.
    pub fn from_deferred<F>(call: F) -> Self
    where
        F: Fn() -> Deferred<V> + Send + Sync + 'static,
    {
        Self {
            call: Arc::new(call),
            handlers: Mutex::new(HashMap::new()),
            next_handler: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }
}

impl<V> InvocationContext<V> {
    /// Invoke the guarded call once.
    pub fn call(&self) -> Deferred<V> {
        (self.call)()
    }

    /// Register a handler for `event`. It stays registered until [`remove`](Self::remove)
    /// is called with the returned id.
    pub fn on<F>(&self, event: InvocationEvent, handler: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Unregister a handler. Returns `false` if it was already gone.
    pub fn remove(&self, event: InvocationEvent, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(&event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(registered, _)| *registered != id);
        before != list.len()
    }

    /// Number of handlers currently registered for `event`.
    pub fn handler_count(&self, event: InvocationEvent) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .map_or(0, Vec::len)
    }

    /// Broadcast `event` to every handler registered so far.
    pub fn fire(&self, event: InvocationEvent) {
        if event == InvocationEvent::Cancel {
            self.cancelled.store(true, Ordering::Release);
            self.cancel_notify.notify_waiters();
        }
        // snapshot so handlers may register further handlers without deadlocking
        let snapshot: Vec<Handler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();
        tracing::trace!(?event, handlers = snapshot.len(), "invocation event fired");
        for handler in snapshot {
            handler();
        }
    }

    /// Shorthand for firing [`InvocationEvent::Cancel`].
    pub fn cancel(&self) {
        self.fire(InvocationEvent::Cancel);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once the invocation is cancelled (immediately if it already was).
    pub async fn cancelled(&self) {
        loop {
            let notified = self.cancel_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
