//! Offload strategy: runs the rest of the chain on its own tokio task.
//!
//! This is the piece that owns an execution substrate, so it is the one that turns the
//! context's `CANCEL` and `TIMEOUT` events into an actual interruption: both abort the spawned
//! task. Dropping the offload future aborts it too. The abort handlers live only as long as the
//! attempt, so a retried invocation does not accumulate them. Synchronous guarded calls are already moved
//! to the blocking pool by [`InvocationContext::blocking`]; aborting that task abandons the
//! blocking call without stopping its thread.

use crate::context::{HandlerId, InvocationContext, InvocationEvent};
use crate::error::ResilienceError;
use crate::strategy::{SharedStrategy, Strategy};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Ties one spawned attempt to the context: aborts the task and unregisters its handlers when
/// the attempt ends or the awaiting future goes away.
struct Attempt<'a, V> {
    ctx: &'a InvocationContext<V>,
    abort: AbortHandle,
    handlers: Vec<(InvocationEvent, HandlerId)>,
}

impl<'a, V> Attempt<'a, V> {
    fn register(ctx: &'a InvocationContext<V>, abort: AbortHandle) -> Self {
        let handlers = [InvocationEvent::Cancel, InvocationEvent::Timeout]
            .into_iter()
            .map(|event| {
                let abort = abort.clone();
                (event, ctx.on(event, move || abort.abort()))
            })
            .collect();
        Self { ctx, abort, handlers }
    }
}

impl<V> Drop for Attempt<'_, V> {
    fn drop(&mut self) {
        self.abort.abort();
        for (event, id) in self.handlers.drain(..) {
            self.ctx.remove(event, id);
        }
    }
}

pub struct Offload<V> {
    delegate: SharedStrategy<V>,
    runtime: Option<Handle>,
}

impl<V> fmt::Debug for Offload<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Offload").field("dedicated_runtime", &self.runtime.is_some()).finish()
    }
}

impl<V: Send + 'static> Offload<V> {
    /// Spawn onto the runtime driving the caller.
    pub fn new(delegate: SharedStrategy<V>) -> Self {
        Self { delegate, runtime: None }
    }

    /// Spawn onto a specific runtime.
    pub fn on(delegate: SharedStrategy<V>, runtime: Handle) -> Self {
        Self { delegate, runtime: Some(runtime) }
    }
}

#[async_trait]
impl<V: Send + 'static> Strategy<V> for Offload<V> {
    async fn apply(&self, ctx: &Arc<InvocationContext<V>>) -> Result<V, ResilienceError> {
        if ctx.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }
        let delegate = self.delegate.clone();
        let task_ctx = ctx.clone();
        let work = async move { delegate.apply(&task_ctx).await };
        let handle = match &self.runtime {
            Some(runtime) => runtime.spawn(work),
            None => tokio::spawn(work),
        };

        let _attempt = Attempt::register(ctx, handle.abort_handle());
        // a cancel fired before the handlers were registered
        if ctx.is_cancelled() {
            handle.abort();
        }

        match handle.await {
            Ok(result) => result,
            Err(join) if join.is_cancelled() => {
                tracing::trace!("offloaded task aborted");
                Err(ResilienceError::Cancelled)
            }
            Err(join) => Err(ResilienceError::inner(join)),
        }
    }
}
