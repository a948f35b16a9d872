use cloudpace::{
    CancelHandle, ClassSet, ClientError, LimitationClass, ManualClock, MethodSet, QuotaLayer,
    QuotaLimiter, QuotaRule, QuotaRuleTable, Sleeper, SubjectCategory, ThrottleMode,
    TrackingSleeper,
};
use http::{Method, Request, Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{Service, ServiceBuilder, ServiceExt};

const MINUTE: u64 = 60_000;

fn limiter(count: u64, clock: &ManualClock) -> QuotaLimiter {
    let rule = QuotaRule::new(
        MethodSet::GET,
        "/items/:id",
        ClassSet::of(&[LimitationClass::All, LimitationClass::Authenticated]),
        MINUTE,
        count,
        &["id"],
    )
    .unwrap();
    QuotaLimiter::builder().rules(QuotaRuleTable::new(vec![rule])).clock(clock.clone()).build()
}

fn get(path: &str) -> Request<()> {
    Request::builder().method(Method::GET).uri(path).body(()).unwrap()
}

/// Upstream stub answering with `status` and counting calls.
#[derive(Clone)]
struct Upstream {
    calls: Arc<AtomicUsize>,
    status: StatusCode,
}

impl Upstream {
    fn new(status: StatusCode) -> Self {
        Self { calls: Arc::new(AtomicUsize::new(0)), status }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Service<Request<()>> for Upstream {
    type Response = Response<&'static str>;
    type Error = std::io::Error;
    type Future = futures::future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<()>) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Ok(Response::builder().status(self.status).body("ok").unwrap()))
    }
}

/// Sleeper that never wakes up.
#[derive(Debug)]
struct PendingSleeper;

impl Sleeper for PendingSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(futures::future::pending())
    }
}

#[tokio::test]
async fn fail_mode_rejects_without_calling_upstream() {
    let clock = ManualClock::new(1_000);
    let upstream = Upstream::new(StatusCode::OK);
    let mut svc =
        ServiceBuilder::new().layer(QuotaLayer::new(limiter(2, &clock))).service(upstream.clone());

    for _ in 0..2 {
        let res = svc.ready().await.unwrap().call(get("/items/5")).await;
        assert_eq!(res.unwrap().status(), StatusCode::OK);
    }

    let err = svc.ready().await.unwrap().call(get("/items/5")).await.unwrap_err();
    assert_eq!(err.retry_at(), Some(Some(1_000 + MINUTE)));
    assert_eq!(upstream.calls(), 2);

    // Another resource id has its own bucket.
    let res = svc.ready().await.unwrap().call(get("/items/6")).await;
    assert!(res.is_ok());
}

#[tokio::test]
async fn upstream_429_is_not_counted() {
    let clock = ManualClock::new(0);
    let limiter = limiter(1, &clock);
    let upstream = Upstream::new(StatusCode::TOO_MANY_REQUESTS);
    let svc = ServiceBuilder::new().layer(QuotaLayer::new(limiter.clone())).service(upstream);

    let res = svc.clone().oneshot(get("/items/5")).await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limiter.is_request_allowed(&Method::GET, "/items/5", None));
    assert!(limiter.counters(None).is_empty());
}

#[tokio::test]
async fn subject_is_read_from_request_extensions() {
    let clock = ManualClock::new(0);
    let limiter = limiter(5, &clock);
    let key = limiter.register_subject(SubjectCategory::Authenticated);
    let svc = ServiceBuilder::new()
        .layer(QuotaLayer::new(limiter.clone()))
        .service(Upstream::new(StatusCode::OK));

    let mut req = get("/items/5");
    req.extensions_mut().insert(key);
    svc.oneshot(req).await.unwrap();

    assert_eq!(limiter.counters(Some(key)).len(), 1);
    assert_eq!(limiter.counters(None).len(), 1);
}

#[tokio::test]
async fn yield_mode_waits_out_the_window() {
    let clock = ManualClock::new(0);
    let sleeper = TrackingSleeper::advancing(clock.clone());
    let upstream = Upstream::new(StatusCode::OK);
    let layer = QuotaLayer::new(limiter(1, &clock))
        .with_mode(ThrottleMode::Yield { max_attempts: None })
        .with_sleeper(sleeper.clone());
    let mut svc = ServiceBuilder::new().layer(layer).service(upstream.clone());

    svc.ready().await.unwrap().call(get("/items/5")).await.unwrap();
    clock.advance(1_000);
    svc.ready().await.unwrap().call(get("/items/5")).await.unwrap();

    assert_eq!(sleeper.calls(), vec![Duration::from_millis(MINUTE)]);
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test]
async fn yield_mode_respects_attempt_cap() {
    let clock = ManualClock::new(0);
    let sleeper = TrackingSleeper::new();
    let layer = QuotaLayer::new(limiter(1, &clock))
        .with_mode(ThrottleMode::Yield { max_attempts: Some(3) })
        .with_sleeper(sleeper.clone());
    let mut svc = ServiceBuilder::new().layer(layer).service(Upstream::new(StatusCode::OK));

    svc.ready().await.unwrap().call(get("/items/5")).await.unwrap();
    // The clock never moves, so the quota never clears.
    let err = svc.ready().await.unwrap().call(get("/items/5")).await.unwrap_err();

    assert!(err.is_quota_exceeded());
    assert_eq!(sleeper.calls().len(), 3);
}

#[tokio::test]
async fn yield_mode_gives_up_on_zero_quota() {
    let clock = ManualClock::new(0);
    let sleeper = TrackingSleeper::new();
    let layer = QuotaLayer::new(limiter(0, &clock))
        .with_mode(ThrottleMode::Yield { max_attempts: None })
        .with_sleeper(sleeper.clone());
    let svc = ServiceBuilder::new().layer(layer).service(Upstream::new(StatusCode::OK));

    let err = svc.oneshot(get("/items/5")).await.unwrap_err();

    assert_eq!(err.retry_at(), Some(None));
    assert!(sleeper.calls().is_empty());
}

#[tokio::test]
async fn cancel_interrupts_a_pending_wait() {
    let clock = ManualClock::new(0);
    let cancel = CancelHandle::new();
    let layer = QuotaLayer::new(limiter(1, &clock))
        .with_mode(ThrottleMode::Yield { max_attempts: None })
        .with_sleeper(PendingSleeper)
        .with_cancel(cancel.clone());
    let svc = ServiceBuilder::new().layer(layer).service(Upstream::new(StatusCode::OK));

    svc.clone().oneshot(get("/items/5")).await.unwrap();

    let waiting = tokio::spawn(svc.oneshot(get("/items/5")));
    tokio::task::yield_now().await;
    cancel.cancel();

    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Cancelled));
}

#[tokio::test]
async fn inner_errors_pass_through_uncounted() {
    let clock = ManualClock::new(0);
    let limiter = limiter(1, &clock);
    let failing = tower::service_fn(|_req: Request<()>| async {
        Err::<Response<()>, _>(std::io::Error::new(std::io::ErrorKind::Other, "reset"))
    });
    let svc = ServiceBuilder::new().layer(QuotaLayer::new(limiter.clone())).service(failing);

    let err = svc.oneshot(get("/items/5")).await.unwrap_err();

    assert_eq!(err.into_inner().map(|e| e.to_string()), Some("reset".to_string()));
    assert!(limiter.is_request_allowed(&Method::GET, "/items/5", None));
}
