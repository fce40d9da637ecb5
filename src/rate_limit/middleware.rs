use crate::backend::KvBackend;
use crate::error::ConfigError;
use crate::identity::caller_identity;
use crate::policy::LimiterConfig;
use crate::rate_limit::{Decision, FixedWindow, RateLimiter};
use crate::response::{Rejection, RATELIMIT_LIMIT, RATELIMIT_REMAINING};
use crate::telemetry::{emit_best_effort, AdmissionEvent, NullSink, Stage, TelemetrySink};
use axum::http::{HeaderValue, Request};
use axum::response::{IntoResponse, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Build a fixed-window limiter layer over `backend`.
///
/// Fails only on invalid configuration. Backend trouble later on never fails a request:
/// the layer admits and logs instead.
pub fn create_limiter<B>(
    config: LimiterConfig,
    backend: Arc<B>,
) -> Result<RateLimitLayer<FixedWindow<B>>, ConfigError>
where
    B: KvBackend + ?Sized + 'static,
{
    Ok(RateLimitLayer::new(FixedWindow::new(backend, config)?))
}

/// A layer that enforces rate limits using a [`RateLimiter`].
#[derive(Debug)]
pub struct RateLimitLayer<L, S = NullSink> {
    limiter: Arc<L>,
    sink: S,
}

impl<L, S: Clone> Clone for RateLimitLayer<L, S> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), sink: self.sink.clone() }
    }
}

impl<L> RateLimitLayer<L> {
    /// Create a new rate limit layer.
    pub fn new(limiter: L) -> Self {
        Self { limiter: Arc::new(limiter), sink: NullSink }
    }
}

impl<L, S> RateLimitLayer<L, S> {
    /// Send admission events to `sink`.
    pub fn with_sink<S2>(self, sink: S2) -> RateLimitLayer<L, S2> {
        RateLimitLayer { limiter: self.limiter, sink }
    }

    /// The shared limiter, for live window updates or resets.
    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }
}

impl<Inner, L, S: Clone> Layer<Inner> for RateLimitLayer<L, S> {
    type Service = RateLimitService<Inner, L, S>;

    fn layer(&self, service: Inner) -> Self::Service {
        RateLimitService { inner: service, limiter: self.limiter.clone(), sink: self.sink.clone() }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Debug)]
pub struct RateLimitService<Inner, L, S = NullSink> {
    inner: Inner,
    limiter: Arc<L>,
    sink: S,
}

impl<Inner: Clone, L, S: Clone> Clone for RateLimitService<Inner, L, S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), limiter: self.limiter.clone(), sink: self.sink.clone() }
    }
}

/// Header values for an admitted, counted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QuotaHeaders {
    pub(crate) limit: u32,
    pub(crate) remaining: u32,
}

impl QuotaHeaders {
    pub(crate) fn apply(self, response: &mut Response) {
        let headers = response.headers_mut();
        headers.insert(RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
    }
}

/// What the rate limit stage decided for one request.
#[derive(Debug)]
pub(crate) enum Verdict {
    /// Let it through; headers are absent for bypassed or fail-open requests.
    Admit(Option<QuotaHeaders>),
    Reject(Rejection),
}

/// Run the limiter for one request. Backend errors admit.
pub(crate) async fn rate_limit_stage<L, S>(
    limiter: &L,
    sink: &S,
    identity: &str,
    path: &str,
) -> Verdict
where
    L: RateLimiter + ?Sized,
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    match limiter.check(identity, path).await {
        Ok(Decision::Allowed { key, count, limit, remaining }) => {
            emit_best_effort(
                sink.clone(),
                AdmissionEvent::Admitted { key: key.into_string(), count, limit },
            )
            .await;
            Verdict::Admit(Some(QuotaHeaders { limit, remaining }))
        }
        Ok(Decision::Denied { key, count, limit, wait }) => {
            emit_best_effort(
                sink.clone(),
                AdmissionEvent::RateLimited { key: key.into_string(), count, limit, retry_after: wait },
            )
            .await;
            Verdict::Reject(Rejection::RateLimited {
                message: limiter.config().message.clone(),
                retry_after: wait,
                limit,
            })
        }
        Ok(Decision::Bypassed) => {
            emit_best_effort(sink.clone(), AdmissionEvent::Bypassed { path: path.to_string() })
                .await;
            Verdict::Admit(None)
        }
        Err(error) => {
            tracing::warn!(
                target: "gatehouse::rate_limit",
                identity,
                path,
                error = %error,
                "rate limiter backend failed; admitting request"
            );
            emit_best_effort(sink.clone(), AdmissionEvent::FailOpen { stage: Stage::RateLimit, error })
                .await;
            Verdict::Admit(None)
        }
    }
}

impl<Inner, L, S, B> Service<Request<B>> for RateLimitService<Inner, L, S>
where
    Inner: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    Inner::Error: Send + 'static,
    L: RateLimiter + 'static,
    S: TelemetrySink,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let limiter = self.limiter.clone();
        let sink = self.sink.clone();
        // Take the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let identity = caller_identity(&req, limiter.config().trust_proxy);
            let path = req.uri().path().to_string();

            match rate_limit_stage(&*limiter, &sink, &identity, &path).await {
                Verdict::Admit(headers) => {
                    let mut response = inner.call(req).await?;
                    if let Some(headers) = headers {
                        headers.apply(&mut response);
                    }
                    Ok(response)
                }
                Verdict::Reject(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::telemetry::MemorySink;
    use axum::body::Body;
    use axum::http::StatusCode;
    use std::convert::Infallible;
    use std::time::Duration;
    use tower::{service_fn, ServiceExt};

    async fn ok(_req: Request<Body>) -> Result<Response, Infallible> {
        Ok(StatusCode::OK.into_response())
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn sets_quota_headers_then_rejects() {
        let backend = Arc::new(InMemoryBackend::new());
        let layer = create_limiter(LimiterConfig::new(Duration::from_secs(60), 2), backend).unwrap();
        let svc = layer.layer(service_fn(ok));

        let first = svc.clone().oneshot(get("/api")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["ratelimit-limit"], "2");
        assert_eq!(first.headers()["ratelimit-remaining"], "1");

        let second = svc.clone().oneshot(get("/api")).await.unwrap();
        assert_eq!(second.headers()["ratelimit-remaining"], "0");

        let third = svc.oneshot(get("/api")).await.unwrap();
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(third.headers()["retry-after"], "60");
    }

    #[tokio::test]
    async fn bypassed_path_has_no_headers_and_no_counter() {
        let backend = Arc::new(InMemoryBackend::new());
        let sink = MemorySink::new();
        let layer = create_limiter(LimiterConfig::new(Duration::from_secs(60), 1), backend.clone())
            .unwrap()
            .with_sink(sink.clone());
        let svc = layer.layer(service_fn(ok));

        for _ in 0..3 {
            let response = svc.clone().oneshot(get("/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("ratelimit-limit").is_none());
        }
        assert!(backend.is_empty());
        assert_eq!(sink.of_kind("bypassed").len(), 3);
    }

    #[tokio::test]
    async fn backend_outage_admits_and_reports() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_available(false);
        let sink = MemorySink::new();
        let layer = create_limiter(LimiterConfig::new(Duration::from_secs(60), 1), backend)
            .unwrap()
            .with_sink(sink.clone());
        let svc = layer.layer(service_fn(ok));

        for _ in 0..3 {
            assert_eq!(svc.clone().oneshot(get("/api")).await.unwrap().status(), StatusCode::OK);
        }
        let events = sink.of_kind("fail_open");
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], AdmissionEvent::FailOpen { stage: Stage::RateLimit, .. }));
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let result = create_limiter(
            LimiterConfig::new(Duration::from_millis(10), 5),
            Arc::new(InMemoryBackend::new()),
        );
        assert!(matches!(result, Err(ConfigError::WindowTooShort(_))));
    }
}
