//! The strategy abstraction every resilience policy implements.
//!
//! A chain is built from the inside out: the terminal [`Invocation`] calls the guarded call,
//! and each policy wraps a delegate `Arc<dyn Strategy<V>>`. Applying the outermost strategy
//! applies the whole chain. Strategies are shared across concurrent invocations, so any state
//! they keep (breaker windows, bulkhead permits, limiter windows) lives behind `&self`.
use crate::context::InvocationContext;
use crate::error::ResilienceError;
use async_trait::async_trait;
use std::sync::Arc;

/// A composable resilience policy around a guarded call.
#[async_trait]
pub trait Strategy<V: Send + 'static>: Send + Sync {
    /// Run one invocation through this strategy and everything it wraps.
    async fn apply(&self, ctx: &Arc<InvocationContext<V>>) -> Result<V, ResilienceError>;
}

/// Shared handle to a strategy, the form delegates are held in.
pub type SharedStrategy<V> = Arc<dyn Strategy<V>>;

/// Terminal strategy: invokes the guarded call exactly once.
#[derive(Debug, Default, Clone, Copy)]
pub struct Invocation;

impl Invocation {
    pub fn shared<V: Send + 'static>() -> SharedStrategy<V> {
        Arc::new(Invocation)
    }
}

#[async_trait]
impl<V: Send + 'static> Strategy<V> for Invocation {
    async fn apply(&self, ctx: &Arc<InvocationContext<V>>) -> Result<V, ResilienceError> {
        ctx.call().await
    }
}

#[async_trait]
impl<V, S> Strategy<V> for Arc<S>
where
    V: Send + 'static,
    S: Strategy<V> + ?Sized,
{
    async fn apply(&self, ctx: &Arc<InvocationContext<V>>) -> Result<V, ResilienceError> {
        (**self).apply(ctx).await
    }
}
