use faultguard::{
    Backoff, ClockSleeper, CustomBackoff, ErrorMatcher, FailureContext, Guard, Jitter, ManualClock,
    ResilienceError, RetryConfig, TrackingSleeper,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct Transient;

impl std::fmt::Display for Transient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transient")
    }
}

impl std::error::Error for Transient {}

#[derive(Debug)]
struct Fatal;

impl std::fmt::Display for Fatal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fatal")
    }
}

impl std::error::Error for Fatal {}

fn counting_failure<E>(calls: Arc<AtomicUsize>, error: fn() -> E) -> impl Fn() -> futures::future::Ready<Result<u32, E>> + Send + Sync + 'static
where
    E: std::error::Error + Send + Sync + 'static,
{
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Err(error()))
    }
}

#[tokio::test]
async fn permanent_failure_is_invoked_max_retries_plus_one_times() {
    let sleeper = TrackingSleeper::new();
    let guard = Guard::<u32>::builder()
        .retry(
            RetryConfig::builder()
                .max_retries(4)
                .backoff(Backoff::fibonacci(Duration::from_millis(10)))
                .jitter(Jitter::None)
                .sleeper(sleeper.clone())
                .build()
                .unwrap(),
        )
        .build();

    let calls = Arc::new(AtomicUsize::new(0));
    let err = guard.call(counting_failure(calls.clone(), || Transient)).await.unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert!(err.is_retry_exhausted());
    assert!(err.last_failure().unwrap().downcast_inner::<Transient>().is_some());
    assert_eq!(
        sleeper.calls(),
        vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(30),
            Duration::from_millis(50),
        ]
    );
}

#[tokio::test]
async fn errors_outside_the_retry_set_are_not_retried() {
    let config = RetryConfig::<u32>::builder()
        .retry_on(ErrorMatcher::of::<Transient>())
        .jitter(Jitter::None)
        .sleeper(TrackingSleeper::new())
        .build()
        .unwrap();
    let guard = Guard::<u32>::builder().retry(config).build();

    let calls = Arc::new(AtomicUsize::new(0));
    let err = guard.call(counting_failure(calls.clone(), || Fatal)).await.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(err.downcast_inner::<Fatal>().is_some());
}

#[tokio::test]
async fn abort_on_wins_over_retry_on() {
    let config = RetryConfig::<u32>::builder()
        .retry_on(ErrorMatcher::any())
        .abort_on(ErrorMatcher::of::<Fatal>())
        .jitter(Jitter::None)
        .sleeper(TrackingSleeper::new())
        .build()
        .unwrap();
    let guard = Guard::<u32>::builder().retry(config).build();

    let calls = Arc::new(AtomicUsize::new(0));
    let _ = guard.call(counting_failure(calls.clone(), || Fatal)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_values_are_retried_and_exhaust_without_a_cause() {
    let config = RetryConfig::<u32>::builder()
        .max_retries(2)
        .retry_on_result(|v| *v == 0)
        .jitter(Jitter::None)
        .sleeper(TrackingSleeper::new())
        .build()
        .unwrap();
    let guard = Guard::<u32>::builder().retry(config).build();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let err = guard
        .call(move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok::<u32, Transient>(0) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match err {
        ResilienceError::RetryExhausted { attempts: 3, last: None } => {}
        other => panic!("expected RetryExhausted without cause, got {other:?}"),
    }
}

#[tokio::test]
async fn max_duration_stops_retrying() {
    let clock = ManualClock::new();
    let sleeper = ClockSleeper::new(clock.clone());
    let config = RetryConfig::<u32>::builder()
        .unbounded_retries()
        .max_duration(Duration::from_secs(1))
        .backoff(Backoff::constant(Duration::from_millis(300)))
        .jitter(Jitter::None)
        .sleeper(sleeper.clone())
        .clock(clock)
        .build()
        .unwrap();
    let guard = Guard::<u32>::builder().retry(config).build();

    let calls = Arc::new(AtomicUsize::new(0));
    let err = guard.call(counting_failure(calls.clone(), || Transient)).await.unwrap_err();

    assert!(err.is_retry_exhausted());
    // sleeps at 300, 600, 900; the fourth sleep reaches 1200 and ends the loop
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(sleeper.calls().len(), 4);
}

#[test]
fn max_delay_must_stay_below_max_duration() {
    let err = RetryConfig::<u32>::builder()
        .max_duration(Duration::from_secs(1))
        .backoff(Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(2)).unwrap())
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("must be less than max duration"));
}

#[derive(Default)]
struct Linear {
    step: Duration,
    next: Duration,
}

impl CustomBackoff for Linear {
    fn init(&mut self, initial: Duration) {
        self.step = initial;
        self.next = initial;
    }

    fn next_delay(&mut self, failure: Option<&ResilienceError>) -> Duration {
        let delay = self.next;
        if failure.is_some() {
            self.next += self.step;
        }
        delay
    }
}

#[tokio::test]
async fn custom_backoff_and_hook_see_each_failure() {
    let sleeper = TrackingSleeper::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook_seen = seen.clone();
    let config = RetryConfig::<u32>::builder()
        .max_retries(3)
        .backoff(Backoff::custom(Duration::from_millis(5), Linear::default))
        .jitter(Jitter::None)
        .before_retry(move |ctx: &FailureContext<'_>| {
            hook_seen.lock().unwrap().push((ctx.attempt, ctx.failure.is_some()));
        })
        .sleeper(sleeper.clone())
        .build()
        .unwrap();
    let guard = Guard::<u32>::builder().retry(config).build();

    let calls = Arc::new(AtomicUsize::new(0));
    let _ = guard.call(counting_failure(calls, || Transient)).await;

    assert_eq!(
        sleeper.calls(),
        vec![Duration::from_millis(5), Duration::from_millis(10), Duration::from_millis(15)]
    );
    assert_eq!(*seen.lock().unwrap(), vec![(1, true), (2, true), (3, true)]);
}
