//! Admission stack: reputation, then rate limit, then usage accounting.
//!
//! Stage order per request:
//! 1. **Reputation**: a blocked caller gets 403 and nothing else happens. No quota is
//!    spent and no usage is recorded.
//! 2. **Rate limit**: the counter is charged and a decision made.
//! 3. **Usage**: recorded whether the rate limiter admitted or rejected.
//! 4. The inner service runs only if admitted; otherwise the 429 goes back.
//!
//! Each stage fails open on its own: an unreachable backend never turns into a rejection.
//!
//! ```rust
//! use gatehouse::{presets, AdmissionLayer, InMemoryBackend};
//! use std::sync::Arc;
//!
//! let backend = Arc::new(InMemoryBackend::new());
//! let admission = AdmissionLayer::builder(backend)
//!     .limiter(presets::api())
//!     .build()
//!     .expect("valid preset");
//! assert_eq!(admission.limiter().window().quota(), 100);
//! ```

use crate::backend::KvBackend;
use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::identity::caller_identity;
use crate::policy::LimiterConfig;
use crate::rate_limit::middleware::{rate_limit_stage, Verdict};
use crate::rate_limit::{FixedWindow, RateLimiter};
use crate::reputation::{reputation_stage, ReputationStore};
use crate::telemetry::{NullSink, TelemetrySink};
use crate::usage::{usage_stage, UsageAccounting};
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Tower layer running all three admission stages in order.
pub struct AdmissionLayer<L, B: ?Sized, S = NullSink> {
    reputation: ReputationStore<B>,
    limiter: Arc<L>,
    usage: UsageAccounting<B>,
    sink: S,
}

impl<L, B: ?Sized, S: Clone> Clone for AdmissionLayer<L, B, S> {
    fn clone(&self) -> Self {
        Self {
            reputation: self.reputation.clone(),
            limiter: self.limiter.clone(),
            usage: self.usage.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<B> AdmissionLayer<FixedWindow<B>, B>
where
    B: KvBackend + ?Sized + 'static,
{
    pub fn builder(backend: Arc<B>) -> AdmissionStackBuilder<B> {
        AdmissionStackBuilder::new(backend)
    }
}

impl<L, B> AdmissionLayer<L, B>
where
    L: RateLimiter + 'static,
    B: KvBackend + ?Sized + 'static,
{
    /// Assemble from already-built stages, e.g. with a custom [`RateLimiter`].
    pub fn from_parts(reputation: ReputationStore<B>, limiter: L, usage: UsageAccounting<B>) -> Self {
        Self { reputation, limiter: Arc::new(limiter), usage, sink: NullSink }
    }
}

impl<L, B: ?Sized, S> AdmissionLayer<L, B, S> {
    pub fn with_sink<S2>(self, sink: S2) -> AdmissionLayer<L, B, S2> {
        AdmissionLayer { reputation: self.reputation, limiter: self.limiter, usage: self.usage, sink }
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }

    /// Handle for blocking and unblocking callers.
    pub fn reputation(&self) -> &ReputationStore<B> {
        &self.reputation
    }

    /// Handle for reading usage.
    pub fn usage(&self) -> &UsageAccounting<B> {
        &self.usage
    }
}

impl<Inner, L, B: ?Sized, S: Clone> Layer<Inner> for AdmissionLayer<L, B, S> {
    type Service = AdmissionService<Inner, L, B, S>;

    fn layer(&self, inner: Inner) -> Self::Service {
        AdmissionService {
            inner,
            reputation: self.reputation.clone(),
            limiter: self.limiter.clone(),
            usage: self.usage.clone(),
            sink: self.sink.clone(),
        }
    }
}

/// Service produced by [`AdmissionLayer`].
pub struct AdmissionService<Inner, L, B: ?Sized, S = NullSink> {
    inner: Inner,
    reputation: ReputationStore<B>,
    limiter: Arc<L>,
    usage: UsageAccounting<B>,
    sink: S,
}

impl<Inner: Clone, L, B: ?Sized, S: Clone> Clone for AdmissionService<Inner, L, B, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            reputation: self.reputation.clone(),
            limiter: self.limiter.clone(),
            usage: self.usage.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<Inner, L, B, S, Body> Service<Request<Body>> for AdmissionService<Inner, L, B, S>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    Inner::Error: Send + 'static,
    L: RateLimiter + 'static,
    B: KvBackend + ?Sized + 'static,
    S: TelemetrySink,
    S::Future: Send + 'static,
    Body: Send + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Inner::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let reputation = self.reputation.clone();
        let limiter = self.limiter.clone();
        let usage = self.usage.clone();
        let sink = self.sink.clone();
        let identity = caller_identity(&req, limiter.config().trust_proxy);
        let path = req.uri().path().to_string();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            if let Some(rejection) = reputation_stage(&reputation, &sink, &identity).await {
                return Ok(rejection.into_response());
            }

            let verdict = rate_limit_stage(&*limiter, &sink, &identity, &path).await;
            usage_stage(&usage, &sink, &identity, &path).await;

            match verdict {
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

/// Builder for [`AdmissionLayer`] over one shared backend.
pub struct AdmissionStackBuilder<B: ?Sized> {
    backend: Arc<B>,
    limiter: Option<LimiterConfig>,
    clock: Arc<dyn Clock>,
}

impl<B> AdmissionStackBuilder<B>
where
    B: KvBackend + ?Sized + 'static,
{
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend, limiter: None, clock: Arc::new(SystemClock) }
    }

    /// Rate limit policy. Defaults to [`LimiterConfig::default`].
    pub fn limiter(mut self, config: LimiterConfig) -> Self {
        self.limiter = Some(config);
        self
    }

    /// Clock for block timestamps and usage dates.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> Result<AdmissionLayer<FixedWindow<B>, B>, ConfigError> {
        let limiter = FixedWindow::new(self.backend.clone(), self.limiter.unwrap_or_default())?;
        let reputation = ReputationStore::new(self.backend.clone()).with_clock(self.clock.clone());
        let usage = UsageAccounting::new(self.backend).with_clock(self.clock);
        Ok(AdmissionLayer::from_parts(reputation, limiter, usage))
    }
}
