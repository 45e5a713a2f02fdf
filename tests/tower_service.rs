use faultguard::{CircuitBreakerConfig, CircuitState, FallbackConfig, Guard, GuardLayer, TimeoutPolicy};
use std::convert::Infallible;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{Layer, Service, ServiceBuilder, ServiceExt};

#[tokio::test]
async fn breaker_opens_around_a_failing_service() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let guard = Guard::<String>::builder()
        .circuit_breaker(
            CircuitBreakerConfig::builder()
                .request_volume_threshold(3)
                .failure_ratio(1.0)
                .delay(Duration::from_secs(30))
                .build()
                .unwrap(),
        )
        .build();
    let breaker = guard.circuit_breaker().unwrap().clone();

    let mut svc = ServiceBuilder::new().layer(GuardLayer::new(guard)).service_fn(move |_req: &'static str| {
        c.fetch_add(1, Ordering::SeqCst);
        async { Err::<String, _>(io::Error::new(io::ErrorKind::ConnectionRefused, "down")) }
    });

    for _ in 0..3 {
        let err = ServiceExt::<&'static str>::ready(&mut svc).await.unwrap().call("ping").await.unwrap_err();
        assert!(err.downcast_inner::<io::Error>().is_some());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let err = ServiceExt::<&'static str>::ready(&mut svc).await.unwrap().call("ping").await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn slow_service_falls_back_after_timeout() {
    let guard = Guard::<String>::builder()
        .fallback(FallbackConfig::value("cached".to_string()).build())
        .timeout(TimeoutPolicy::new(Duration::from_millis(100)).unwrap())
        .build();

    let svc = GuardLayer::new(guard).layer(tower::service_fn(|req: String| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok::<_, Infallible>(req)
    }));

    let response = svc.oneshot("fresh".to_string()).await.unwrap();
    assert_eq!(response, "cached");
}
