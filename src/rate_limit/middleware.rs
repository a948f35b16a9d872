use crate::error::ClientError;
use crate::rate_limit::{Decision, QuotaLimiter, SubjectId};
use crate::sleeper::{Sleeper, TokioSleeper};
use futures::future::BoxFuture;
use http::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tower_layer::Layer;
use tower_service::Service;

/// What to do when a request hits an exhausted quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThrottleMode {
    /// Return [`ClientError::QuotaExceeded`] immediately.
    #[default]
    Fail,
    /// Sleep until the quota clears, then check again.
    ///
    /// `max_attempts` caps the number of waits; `None` keeps waiting for as long as the quota
    /// keeps reporting a recovery time.
    Yield { max_attempts: Option<usize> },
}

/// Cancels pending quota waits. Clones share the same signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Abort every current and future wait observing this handle.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancelHandle::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// A layer that enforces client-side quotas using a [`QuotaLimiter`].
#[derive(Clone, Debug)]
pub struct QuotaLayer {
    limiter: QuotaLimiter,
    mode: ThrottleMode,
    sleeper: Arc<dyn Sleeper>,
    cancel: Option<CancelHandle>,
}

impl QuotaLayer {
    /// Create a fail-fast quota layer.
    pub fn new(limiter: QuotaLimiter) -> Self {
        Self { limiter, mode: ThrottleMode::Fail, sleeper: Arc::new(TokioSleeper), cancel: None }
    }

    pub fn with_mode(mut self, mode: ThrottleMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override how waits are performed (tests inject `TrackingSleeper`).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl<S> Layer<S> for QuotaLayer {
    type Service = QuotaService<S>;

    fn layer(&self, service: S) -> Self::Service {
        QuotaService {
            inner: service,
            limiter: self.limiter.clone(),
            mode: self.mode,
            sleeper: self.sleeper.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Middleware service that enforces client-side quotas on HTTP requests.
///
/// The quota subject is read from the request extensions ([`SubjectId`]); requests without
/// one are anonymous. Successful responses are counted unless the upstream answered
/// `429 Too Many Requests`.
#[derive(Clone, Debug)]
pub struct QuotaService<S> {
    inner: S,
    limiter: QuotaLimiter,
    mode: ThrottleMode,
    sleeper: Arc<dyn Sleeper>,
    cancel: Option<CancelHandle>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for QuotaService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = ClientError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ClientError::Inner)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let gate = Gate {
            limiter: self.limiter.clone(),
            mode: self.mode,
            sleeper: self.sleeper.clone(),
            cancel: self.cancel.clone(),
        };

        Box::pin(async move {
            let method = req.method().clone();
            let url = req.uri().to_string();
            let subject = req.extensions().get::<SubjectId>().copied();

            gate.acquire::<S::Error>(&method, &url, subject).await?;

            let response = inner.call(req).await.map_err(ClientError::Inner)?;
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                tracing::warn!(%method, %url, "upstream rate limited the request; not counted");
            } else {
                gate.limiter.increment(&method, &url, subject);
            }
            Ok(response)
        })
    }
}

struct Gate {
    limiter: QuotaLimiter,
    mode: ThrottleMode,
    sleeper: Arc<dyn Sleeper>,
    cancel: Option<CancelHandle>,
}

impl Gate {
    /// Wait (or fail) until the limiter allows the request.
    async fn acquire<E>(
        &self,
        method: &Method,
        url: &str,
        subject: Option<SubjectId>,
    ) -> Result<(), ClientError<E>> {
        let mut waits = 0usize;
        loop {
            if self.cancel.as_ref().map_or(false, CancelHandle::is_cancelled) {
                return Err(ClientError::Cancelled);
            }
            let retry_at = match self.limiter.check(method, url, subject) {
                Decision::Allowed => return Ok(()),
                Decision::Denied { retry_at } => retry_at,
            };

            let ThrottleMode::Yield { max_attempts } = self.mode else {
                return Err(ClientError::QuotaExceeded { retry_at });
            };
            let Some(at) = retry_at else {
                tracing::warn!(%method, url, "quota has no recovery time; giving up");
                return Err(ClientError::QuotaExceeded { retry_at });
            };
            if max_attempts.map_or(false, |max| waits >= max) {
                tracing::warn!(%method, url, waits, "quota wait limit reached");
                return Err(ClientError::QuotaExceeded { retry_at });
            }
            waits += 1;

            let delay = Duration::from_millis(at.saturating_sub(self.limiter.now_millis()));
            tracing::warn!(%method, url, ?delay, attempt = waits, "quota exhausted; waiting");
            match &self.cancel {
                Some(cancel) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                        _ = self.sleeper.sleep(delay) => {}
                    }
                }
                None => self.sleeper.sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_handle_is_shared_between_clones() {
        let handle = CancelHandle::new();
        let other = handle.clone();
        assert!(!other.is_cancelled());
        handle.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let handle = CancelHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        handle.cancel();
        task.await.unwrap();
    }

    #[test]
    fn default_mode_is_fail() {
        assert_eq!(ThrottleMode::default(), ThrottleMode::Fail);
    }
}
