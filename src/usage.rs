//! Per-day usage accounting.
//!
//! Every request that passes the reputation check bumps `usage:{identity}:{YYYY-MM-DD}`
//! (UTC day) at field `path`, and pushes the hash's expiry out to [`USAGE_RETENTION`].
//! Accounting is observability only: it never rejects, and a backend failure is logged and
//! ignored.

use crate::backend::KvBackend;
use crate::clock::{Clock, SystemClock};
use crate::error::BackendError;
use crate::identity::caller_identity;
use crate::telemetry::{emit_best_effort, AdmissionEvent, NullSink, Stage, TelemetrySink};
use axum::http::Request;
use axum::response::Response;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// How long a day's usage record is kept after its last write.
pub const USAGE_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

fn usage_key(identity: &str, date: NaiveDate) -> String {
    format!("usage:{identity}:{}", date.format("%Y-%m-%d"))
}

/// Records and reads per-day, per-path request counts.
pub struct UsageAccounting<B: ?Sized> {
    backend: Arc<B>,
    clock: Arc<dyn Clock>,
}

impl<B: ?Sized> Clone for UsageAccounting<B> {
    fn clone(&self) -> Self {
        Self { backend: self.backend.clone(), clock: self.clock.clone() }
    }
}

impl<B: ?Sized> std::fmt::Debug for UsageAccounting<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageAccounting").field("clock", &self.clock).finish_non_exhaustive()
    }
}

impl<B> UsageAccounting<B>
where
    B: KvBackend + ?Sized + 'static,
{
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend, clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Today's date (UTC) by this accounting's clock.
    pub fn today(&self) -> NaiveDate {
        i64::try_from(self.clock.now_millis())
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|at| at.date_naive())
            .unwrap_or_default()
    }

    /// Count one request; returns today's count for `path`.
    pub async fn record(&self, identity: &str, path: &str) -> Result<i64, BackendError> {
        let key = usage_key(identity, self.today());
        let count = self.backend.hash_increment(&key, path, 1).await?;
        self.backend.set_expiry(&key, USAGE_RETENTION).await?;
        Ok(count)
    }

    /// Path counts for `identity` on `date`.
    ///
    /// Empty when nothing was recorded or the backend cannot be read; this never fails.
    pub async fn usage(&self, identity: &str, date: NaiveDate) -> BTreeMap<String, i64> {
        match self.backend.hash_get_all(&usage_key(identity, date)).await {
            Ok(fields) => fields
                .into_iter()
                .filter_map(|(path, count)| count.parse().ok().map(|count| (path, count)))
                .collect(),
            Err(error) => {
                tracing::debug!(target: "gatehouse::usage", identity, %date, error = %error, "usage read failed");
                BTreeMap::new()
            }
        }
    }

    pub async fn usage_today(&self, identity: &str) -> BTreeMap<String, i64> {
        self.usage(identity, self.today()).await
    }
}

/// Record one request, swallowing failures.
pub(crate) async fn usage_stage<B, S>(accounting: &UsageAccounting<B>, sink: &S, identity: &str, path: &str)
where
    B: KvBackend + ?Sized + 'static,
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    if let Err(error) = accounting.record(identity, path).await {
        tracing::debug!(target: "gatehouse::usage", identity, path, error = %error, "usage not recorded");
        emit_best_effort(sink.clone(), AdmissionEvent::FailOpen { stage: Stage::Usage, error }).await;
    }
}

/// Records usage for every request, then forwards it.
pub struct UsageLayer<B: ?Sized, S = NullSink> {
    accounting: UsageAccounting<B>,
    sink: S,
    trust_proxy: bool,
}

impl<B: ?Sized, S: Clone> Clone for UsageLayer<B, S> {
    fn clone(&self) -> Self {
        Self { accounting: self.accounting.clone(), sink: self.sink.clone(), trust_proxy: self.trust_proxy }
    }
}

impl<B> UsageLayer<B>
where
    B: KvBackend + ?Sized + 'static,
{
    pub fn new(accounting: UsageAccounting<B>) -> Self {
        Self { accounting, sink: NullSink, trust_proxy: false }
    }
}

impl<B: ?Sized, S> UsageLayer<B, S> {
    pub fn with_sink<S2>(self, sink: S2) -> UsageLayer<B, S2> {
        UsageLayer { accounting: self.accounting, sink, trust_proxy: self.trust_proxy }
    }

    pub fn trust_proxy(mut self, trust: bool) -> Self {
        self.trust_proxy = trust;
        self
    }
}

impl<Inner, B: ?Sized, S: Clone> Layer<Inner> for UsageLayer<B, S> {
    type Service = UsageService<Inner, B, S>;

    fn layer(&self, inner: Inner) -> Self::Service {
        UsageService {
            inner,
            accounting: self.accounting.clone(),
            sink: self.sink.clone(),
            trust_proxy: self.trust_proxy,
        }
    }
}

/// Service produced by [`UsageLayer`].
pub struct UsageService<Inner, B: ?Sized, S = NullSink> {
    inner: Inner,
    accounting: UsageAccounting<B>,
    sink: S,
    trust_proxy: bool,
}

impl<Inner: Clone, B: ?Sized, S: Clone> Clone for UsageService<Inner, B, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            accounting: self.accounting.clone(),
            sink: self.sink.clone(),
            trust_proxy: self.trust_proxy,
        }
    }
}

impl<Inner, B, S, Body> Service<Request<Body>> for UsageService<Inner, B, S>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    Inner::Error: Send + 'static,
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
        let accounting = self.accounting.clone();
        let sink = self.sink.clone();
        let identity = caller_identity(&req, self.trust_proxy);
        let path = req.uri().path().to_string();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            usage_stage(&accounting, &sink, &identity, &path).await;
            inner.call(req).await
        })
    }
}
