use criterion::{black_box, criterion_group, criterion_main, Criterion};
use faultguard::{CircuitBreakerConfig, Guard, GuardLayer, RetryConfig, TimeoutPolicy};

use futures::future::Ready;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{Service, ServiceBuilder};

// A simple service that just returns its input.
#[derive(Clone)]
struct EchoService;

impl Service<&'static str> for EchoService {
    type Response = &'static str;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: &'static str) -> Self::Future {
        futures::future::ready(Ok(req))
    }
}

// A service that always fails.
#[derive(Clone)]
struct FailingService {
    calls: Arc<AtomicUsize>,
}

impl FailingService {
    fn new() -> Self {
        Self { calls: Arc::new(AtomicUsize::new(0)) }
    }
}

impl Service<&'static str> for FailingService {
    type Response = &'static str;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: &'static str) -> Self::Future {
        self.calls.fetch_add(1, Ordering::Relaxed);
        futures::future::ready(Err(std::io::Error::new(std::io::ErrorKind::Other, "boom")))
    }
}

fn breaker(volume: usize) -> CircuitBreakerConfig {
    CircuitBreakerConfig::builder()
        .request_volume_threshold(volume)
        .failure_ratio(1.0)
        .delay(Duration::from_secs(30))
        .build()
        .unwrap()
}

fn circuit_breaker_throughput_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let guard = Guard::<&'static str>::builder().circuit_breaker(breaker(10)).build();
    let svc = ServiceBuilder::new().layer(GuardLayer::new(guard)).service(EchoService);

    c.bench_function("circuit_breaker_success", |b| {
        b.to_async(&rt).iter(|| async {
            // clones share the breaker; only the service handle is copied
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box("request"))).await;
        });
    });
}

fn circuit_breaker_throughput_open(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    // opens on the first failure and stays open for the whole run
    let guard = Guard::<&'static str>::builder().circuit_breaker(breaker(1)).build();
    let svc = ServiceBuilder::new().layer(GuardLayer::new(guard)).service(FailingService::new());

    c.bench_function("circuit_breaker_open_rejection", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box("request"))).await;
        });
    });
}

fn guard_full_chain_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let guard = Guard::<u64>::builder()
        .retry(RetryConfig::builder().max_retries(3).build().unwrap())
        .circuit_breaker(breaker(20))
        .timeout(TimeoutPolicy::new(Duration::from_secs(1)).unwrap())
        .build();

    c.bench_function("guard_retry_breaker_timeout_success", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(guard.call(|| async { Ok::<_, std::io::Error>(black_box(7u64)) }).await);
        });
    });
}

criterion_group!(
    benches,
    circuit_breaker_throughput_success,
    circuit_breaker_throughput_open,
    guard_full_chain_success
);
criterion_main!(benches);
