//! tower integration: run every request to a service through a [`Guard`].
//!
//! The request must be `Clone` because retries send it again. Readiness of the inner service is
//! awaited inside the chain on a clone of the service, so a bulkhead or rate limiter sees the
//! request before it waits for the inner service.

use crate::context::InvocationContext;
use crate::error::{BoxError, ResilienceError};
use crate::guard::Guard;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

/// A layer that installs a [`Guard`] around a service.
#[derive(Debug)]
pub struct GuardLayer<V> {
    guard: Guard<V>,
}

impl<V> Clone for GuardLayer<V> {
    fn clone(&self) -> Self {
        Self { guard: self.guard.clone() }
    }
}

impl<V> GuardLayer<V> {
    /// Create a new guard layer.
    pub fn new(guard: Guard<V>) -> Self {
        Self { guard }
    }
}

impl<S, V> Layer<S> for GuardLayer<V> {
    type Service = GuardService<S, V>;

    fn layer(&self, service: S) -> Self::Service {
        GuardService { inner: service, guard: self.guard.clone() }
    }
}

/// Middleware service that guards every call to the inner service.
#[derive(Debug)]
pub struct GuardService<S, V> {
    inner: S,
    guard: Guard<V>,
}

impl<S: Clone, V> Clone for GuardService<S, V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), guard: self.guard.clone() }
    }
}

impl<S, V> GuardService<S, V> {
    pub fn new(inner: S, guard: Guard<V>) -> Self {
        Self { inner, guard }
    }

    pub fn guard(&self) -> &Guard<V> {
        &self.guard
    }
}

impl<S, Req> Service<Req> for GuardService<S, S::Response>
where
    S: Service<Req> + Clone + Send + Sync + 'static,
    S::Response: Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    Req: Clone + Send + Sync + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // admission happens inside the chain
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let ctx = Arc::new(InvocationContext::from_deferred(move || {
            let svc = inner.clone();
            let req = req.clone();
            async move {
                let mut svc =
                    ServiceExt::<Req>::ready_oneshot(svc).await.map_err(ResilienceError::inner)?;
                svc.call(req).await.map_err(ResilienceError::inner)
            }
            .boxed()
        }));
        let guard = self.guard.clone();
        async move { guard.execute(ctx).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::sleeper::InstantSleeper;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_through_tower_service() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let svc = tower::service_fn(move |req: u32| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(io::Error::new(io::ErrorKind::Other, "flaky"))
                } else {
                    Ok(req * 2)
                }
            }
        });
        let guard = Guard::<u32>::builder()
            .retry(RetryConfig::<u32>::builder().max_retries(3).sleeper(InstantSleeper).build().unwrap())
            .build();
        let mut service = GuardLayer::new(guard).layer(svc);

        let response = ServiceExt::<u32>::ready(&mut service).await.unwrap().call(21).await.unwrap();
        assert_eq!(response, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
