use faultguard::{
    CircuitBreakerConfig, CircuitBreakerListener, CircuitBreakerRegistry, CircuitState, ErrorMatcher,
    Guard, InMemoryCircuitBreakerRegistry, ManualClock,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct Unavailable;

impl std::fmt::Display for Unavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unavailable")
    }
}

impl std::error::Error for Unavailable {}

#[derive(Debug)]
struct NotFound;

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "not found")
    }
}

impl std::error::Error for NotFound {}

#[derive(Clone, Default)]
struct Transitions(Arc<Mutex<Vec<(CircuitState, CircuitState)>>>);

impl CircuitBreakerListener for Transitions {
    fn state_changed(&self, from: CircuitState, to: CircuitState) {
        self.0.lock().unwrap().push((from, to));
    }
}

async fn fail(guard: &Guard<u32>) {
    let _ = guard.call(|| async { Err::<u32, _>(Unavailable) }).await;
}

async fn succeed(guard: &Guard<u32>) -> bool {
    guard.call(|| async { Ok::<_, Unavailable>(1) }).await.is_ok()
}

#[tokio::test]
async fn full_lifecycle_is_reported_to_listeners() {
    let clock = ManualClock::new();
    let transitions = Transitions::default();
    let config = CircuitBreakerConfig::builder()
        .request_volume_threshold(2)
        .failure_ratio(1.0)
        .delay(Duration::from_millis(500))
        .success_threshold(2)
        .clock(clock.clone())
        .listener(transitions.clone())
        .build()
        .unwrap();
    let guard = Guard::<u32>::builder().circuit_breaker(config).build();
    let breaker = guard.circuit_breaker().unwrap().clone();

    fail(&guard).await;
    fail(&guard).await;
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!succeed(&guard).await);

    clock.advance(Duration::from_millis(500));
    assert!(succeed(&guard).await);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert!(succeed(&guard).await);
    assert_eq!(breaker.state(), CircuitState::Closed);

    assert_eq!(
        *transitions.0.lock().unwrap(),
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}

#[tokio::test]
async fn expected_errors_do_not_trip_the_breaker() {
    let config = CircuitBreakerConfig::builder()
        .request_volume_threshold(3)
        .failure_ratio(0.1)
        .skip_on(ErrorMatcher::of::<NotFound>())
        .build()
        .unwrap();
    let guard = Guard::<u32>::builder().circuit_breaker(config).build();

    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let c = calls.clone();
        let err = guard
            .call(move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, _>(NotFound) }
            })
            .await
            .unwrap_err();
        assert!(err.downcast_inner::<NotFound>().is_some());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 10);
    assert_eq!(guard.circuit_breaker().unwrap().state(), CircuitState::Closed);
}

#[tokio::test]
async fn registry_resets_a_named_breaker() {
    let registry = Arc::new(InMemoryCircuitBreakerRegistry::new());
    let config = CircuitBreakerConfig::builder()
        .name("payments")
        .request_volume_threshold(1)
        .failure_ratio(1.0)
        .delay(Duration::from_secs(60))
        .build()
        .unwrap();
    let guard = Guard::<u32>::builder().circuit_breaker(config).registry(registry.clone()).build();

    fail(&guard).await;
    assert_eq!(registry.state("payments").unwrap(), CircuitState::Open);
    assert!(!succeed(&guard).await);

    registry.reset("payments").unwrap();
    assert!(succeed(&guard).await);
    assert_eq!(registry.snapshot(), vec![("payments".to_string(), CircuitState::Closed)]);
    assert!(registry.get("payments").unwrap().same_breaker(guard.circuit_breaker().unwrap()));
}

#[tokio::test]
async fn unnamed_breakers_are_not_registered() {
    let registry = Arc::new(InMemoryCircuitBreakerRegistry::new());
    let guard = Guard::<u32>::builder()
        .circuit_breaker(CircuitBreakerConfig::builder().build().unwrap())
        .registry(registry.clone())
        .build();
    assert!(guard.circuit_breaker().is_some());
    assert!(registry.is_empty());
}
