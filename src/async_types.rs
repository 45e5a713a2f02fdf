//! Bridge between native async handle types and the canonical [`Deferred`] value.
//!
//! Strategies only understand `Deferred<V>`. A guarded call that hands back some other handle
//! (a oneshot receiver, a join handle, a single-value stream) is adapted through an
//! [`AsyncConverter`] looked up in an [`AsyncTypes`] registry by the handle's type. The guard
//! converts each produced handle into a `Deferred` on the way in and builds a handle of the same
//! type around the whole chain on the way out.
//!
//! `from_deferred` receives a *supplier*, not a deferred value: each subscription of the
//! outgoing handle starts the chain once, and every retry re-invokes the guarded call for a
//! fresh handle rather than replaying an old result.
//!
//! The future and stream converters are lazy and can be built anywhere. The oneshot and join
//! handle converters start the chain on a tokio task as soon as the handle is built, so they
//! need a runtime at that point; see their docs for what happens without one.

use crate::context::Deferred;
use crate::error::ResilienceError;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Starts one run of the guarded chain.
pub type DeferredSupplier<V> = Box<dyn FnOnce() -> Deferred<V> + Send>;

/// Conversion contract between a handle type `H` and `Deferred<V>`.
pub trait AsyncConverter<H, V>: Send + Sync {
    /// Adapt a handle produced by the guarded call.
    fn to_deferred(&self, handle: H) -> Deferred<V>;

    /// Build the handle returned to the caller.
    fn from_deferred(&self, supplier: DeferredSupplier<V>) -> H;
}

/// The handle type has no registered converter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no async converter registered for {type_name}")]
pub struct UnknownAsyncType {
    pub type_name: &'static str,
}

/// A single-value stream ended before producing its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream completed without a value")]
pub struct EmptyStream;

/// A handle that starts the chain eagerly was built outside a tokio runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no tokio runtime to start the guarded chain on")]
pub struct NoRuntime;

/// `Deferred<V>` itself. Lazy: nothing runs until the returned future is polled.
#[derive(Debug, Default, Clone, Copy)]
pub struct FutureConverter;

impl<V: Send + 'static> AsyncConverter<Deferred<V>, V> for FutureConverter {
    fn to_deferred(&self, handle: Deferred<V>) -> Deferred<V> {
        handle
    }

    fn from_deferred(&self, supplier: DeferredSupplier<V>) -> Deferred<V> {
        async move { supplier().await }.boxed()
    }
}

/// `oneshot::Receiver`. Eager: the chain starts on a spawned task right away and is abandoned
/// if the receiver is dropped first. Built outside a runtime, the receiver resolves to a
/// [`NoRuntime`] error and the chain never runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct OneshotConverter;

impl<V: Send + 'static> AsyncConverter<oneshot::Receiver<Result<V, ResilienceError>>, V>
    for OneshotConverter
{
    fn to_deferred(&self, handle: oneshot::Receiver<Result<V, ResilienceError>>) -> Deferred<V> {
        // a dropped sender means the producer gave up
        async move { handle.await.unwrap_or(Err(ResilienceError::Cancelled)) }.boxed()
    }

    fn from_deferred(
        &self,
        supplier: DeferredSupplier<V>,
    ) -> oneshot::Receiver<Result<V, ResilienceError>> {
        let (mut tx, rx) = oneshot::channel();
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("oneshot handle requested outside a tokio runtime");
            let _ = tx.send(Err(ResilienceError::inner(NoRuntime)));
            return rx;
        };
        runtime.spawn(async move {
            let outcome = tokio::select! {
                result = supplier() => Some(result),
                _ = tx.closed() => None,
            };
            if let Some(result) = outcome {
                let _ = tx.send(result);
            }
        });
        rx
    }
}

/// `JoinHandle`. Eager, like [`OneshotConverter`]; aborting the handle aborts the chain.
///
/// # Panics
///
/// `from_deferred` panics when called outside a tokio runtime, as `tokio::spawn` does; a
/// `JoinHandle` cannot exist without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct JoinHandleConverter;

impl<V: Send + 'static> AsyncConverter<JoinHandle<Result<V, ResilienceError>>, V> for JoinHandleConverter {
    fn to_deferred(&self, handle: JoinHandle<Result<V, ResilienceError>>) -> Deferred<V> {
        async move {
            match handle.await {
                Ok(result) => result,
                Err(join) if join.is_cancelled() => Err(ResilienceError::Cancelled),
                Err(join) => Err(ResilienceError::inner(join)),
            }
        }
        .boxed()
    }

    fn from_deferred(&self, supplier: DeferredSupplier<V>) -> JoinHandle<Result<V, ResilienceError>> {
        tokio::spawn(supplier())
    }
}

/// Single-value `BoxStream`. Only the first item counts; an empty stream is an error. Lazy: the
/// chain starts when the stream is first polled.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamConverter;

impl<V: Send + 'static> AsyncConverter<BoxStream<'static, Result<V, ResilienceError>>, V>
    for StreamConverter
{
    fn to_deferred(&self, handle: BoxStream<'static, Result<V, ResilienceError>>) -> Deferred<V> {
        handle
            .into_future()
            .map(|(first, _rest)| first.unwrap_or_else(|| Err(ResilienceError::inner(EmptyStream))))
            .boxed()
    }

    fn from_deferred(&self, supplier: DeferredSupplier<V>) -> BoxStream<'static, Result<V, ResilienceError>> {
        futures::stream::once(async move { supplier().await }).boxed()
    }
}

type Entry = Box<dyn Any + Send + Sync>;

/// Registry of converters keyed by handle type.
#[derive(Default)]
pub struct AsyncTypes {
    converters: HashMap<TypeId, (&'static str, Entry)>,
}

impl fmt::Debug for AsyncTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.converters.values().map(|(name, _)| name)).finish()
    }
}

impl AsyncTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the built-in converters for handles producing `V`.
    pub fn with_builtins<V: Send + 'static>(self) -> Self {
        self.with::<Deferred<V>, V, _>(FutureConverter)
            .with::<oneshot::Receiver<Result<V, ResilienceError>>, V, _>(OneshotConverter)
            .with::<JoinHandle<Result<V, ResilienceError>>, V, _>(JoinHandleConverter)
            .with::<BoxStream<'static, Result<V, ResilienceError>>, V, _>(StreamConverter)
    }

    /// Builder-style [`AsyncTypes::register`].
    pub fn with<H, V, C>(mut self, converter: C) -> Self
    where
        H: 'static,
        V: 'static,
        C: AsyncConverter<H, V> + 'static,
    {
        self.register::<H, V, C>(converter);
        self
    }

    /// Register `converter` for handle type `H`, replacing any previous one.
    pub fn register<H, V, C>(&mut self, converter: C)
    where
        H: 'static,
        V: 'static,
        C: AsyncConverter<H, V> + 'static,
    {
        let shared: Arc<dyn AsyncConverter<H, V>> = Arc::new(converter);
        self.converters.insert(TypeId::of::<H>(), (type_name::<H>(), Box::new(shared)));
    }

    pub fn contains<H: 'static>(&self) -> bool {
        self.converters.contains_key(&TypeId::of::<H>())
    }

    /// Converter for handle type `H`.
    pub fn get<H: 'static, V: 'static>(&self) -> Result<Arc<dyn AsyncConverter<H, V>>, UnknownAsyncType> {
        self.converters
            .get(&TypeId::of::<H>())
            .and_then(|(_, entry)| entry.downcast_ref::<Arc<dyn AsyncConverter<H, V>>>())
            .cloned()
            .ok_or(UnknownAsyncType { type_name: type_name::<H>() })
    }

    pub fn len(&self) -> usize {
        self.converters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_supplier(calls: Arc<AtomicUsize>) -> DeferredSupplier<u32> {
        Box::new(move || {
            async move { Ok(calls.fetch_add(1, Ordering::SeqCst) as u32 + 1) }.boxed()
        })
    }

    #[test]
    fn unknown_type_is_reported() {
        let types = AsyncTypes::new().with_builtins::<u32>();
        assert_eq!(types.len(), 4);
        let err = types.get::<oneshot::Receiver<Result<String, ResilienceError>>, String>().err().unwrap();
        assert!(err.type_name.contains("Receiver"));
        assert!(types.get::<oneshot::Receiver<Result<u32, ResilienceError>>, u32>().is_ok());
    }

    #[tokio::test]
    async fn future_converter_is_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = FutureConverter.from_deferred(counting_supplier(calls.clone()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(handle.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stream_converter_takes_first_item() {
        let stream: BoxStream<'static, Result<u32, ResilienceError>> =
            futures::stream::iter(vec![Ok(1), Ok(2)]).boxed();
        assert_eq!(StreamConverter.to_deferred(stream).await.unwrap(), 1);

        let empty: BoxStream<'static, Result<u32, ResilienceError>> = futures::stream::empty().boxed();
        let err = StreamConverter.to_deferred(empty).await.unwrap_err();
        assert!(err.downcast_inner::<EmptyStream>().is_some());

        let calls = Arc::new(AtomicUsize::new(0));
        let out = StreamConverter.from_deferred(counting_supplier(calls.clone()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(out.collect::<Vec<_>>().await.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oneshot_round_trip() {
        let calls = Arc::new(AtomicUsize::new(0));
        let rx = OneshotConverter.from_deferred(counting_supplier(calls));
        assert_eq!(OneshotConverter.to_deferred(rx).await.unwrap(), 1);

        let (tx, rx) = oneshot::channel::<Result<u32, ResilienceError>>();
        drop(tx);
        assert!(OneshotConverter.to_deferred(rx).await.unwrap_err().is_cancelled());
    }

    #[test]
    fn oneshot_outside_a_runtime_reports_instead_of_panicking() {
        let calls = Arc::new(AtomicUsize::new(0));
        let rx = OneshotConverter.from_deferred(counting_supplier(calls.clone()));
        let err = futures::executor::block_on(OneshotConverter.to_deferred(rx)).unwrap_err();
        assert!(err.downcast_inner::<NoRuntime>().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn lazy_converters_build_outside_a_runtime() {
        let calls = Arc::new(AtomicUsize::new(0));
        let future = FutureConverter.from_deferred(counting_supplier(calls.clone()));
        let stream = StreamConverter.from_deferred(counting_supplier(calls.clone()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(futures::executor::block_on(future).unwrap(), 1);
        let items = futures::executor::block_on(stream.collect::<Vec<_>>());
        assert_eq!(items.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn aborted_join_handle_is_cancelled() {
        let handle: JoinHandle<Result<u32, ResilienceError>> =
            tokio::spawn(futures::future::pending());
        handle.abort();
        assert!(JoinHandleConverter.to_deferred(handle).await.unwrap_err().is_cancelled());
    }
}
