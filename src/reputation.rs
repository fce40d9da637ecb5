//! IP reputation: a shared blocklist checked before any quota is spent.
//!
//! Block state lives in the backend so every instance agrees on it:
//! - set `blocked_ips` holds the blocked identities;
//! - hash `blocked_ip:{identity}` holds `reason` and `blocked_at` (epoch ms).
//!
//! Neither expires. [`ReputationLayer`] answers 403 for blocked callers and lets everything
//! through when the backend cannot be asked.

use crate::backend::KvBackend;
use crate::clock::{Clock, SystemClock};
use crate::error::BackendError;
use crate::identity::caller_identity;
use crate::response::Rejection;
use crate::telemetry::{emit_best_effort, AdmissionEvent, NullSink, Stage, TelemetrySink};
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Set of blocked identities.
pub const BLOCKED_SET_KEY: &str = "blocked_ips";

const REASON_FIELD: &str = "reason";
const BLOCKED_AT_FIELD: &str = "blocked_at";

fn record_key(identity: &str) -> String {
    format!("blocked_ip:{identity}")
}

/// Why and when an identity was blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub reason: String,
    pub blocked_at_millis: u64,
}

/// Reads and writes the shared blocklist.
pub struct ReputationStore<B: ?Sized> {
    backend: Arc<B>,
    clock: Arc<dyn Clock>,
}

impl<B: ?Sized> Clone for ReputationStore<B> {
    fn clone(&self) -> Self {
        Self { backend: self.backend.clone(), clock: self.clock.clone() }
    }
}

impl<B: ?Sized> std::fmt::Debug for ReputationStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationStore").field("clock", &self.clock).finish_non_exhaustive()
    }
}

impl<B> ReputationStore<B>
where
    B: KvBackend + ?Sized + 'static,
{
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend, clock: Arc::new(SystemClock) }
    }

    /// Use `clock` for `blocked_at` timestamps.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub async fn is_blocked(&self, identity: &str) -> Result<bool, BackendError> {
        self.backend.set_contains(BLOCKED_SET_KEY, identity).await
    }

    /// Add `identity` to the blocklist. Blocking again overwrites the reason and timestamp.
    pub async fn block(&self, identity: &str, reason: &str) -> Result<(), BackendError> {
        self.backend.set_add(BLOCKED_SET_KEY, identity).await?;
        let key = record_key(identity);
        self.backend.hash_set(&key, REASON_FIELD, reason).await?;
        let blocked_at = self.clock.now_millis().to_string();
        self.backend.hash_set(&key, BLOCKED_AT_FIELD, &blocked_at).await?;
        tracing::info!(target: "gatehouse::reputation", identity, reason, "identity blocked");
        Ok(())
    }

    /// Remove `identity` from the blocklist along with its record.
    pub async fn unblock(&self, identity: &str) -> Result<(), BackendError> {
        self.backend.set_remove(BLOCKED_SET_KEY, identity).await?;
        self.backend.delete(&record_key(identity)).await?;
        tracing::info!(target: "gatehouse::reputation", identity, "identity unblocked");
        Ok(())
    }

    /// The stored reason and timestamp, if `identity` has a record.
    pub async fn blocked_info(&self, identity: &str) -> Result<Option<BlockRecord>, BackendError> {
        let fields = self.backend.hash_get_all(&record_key(identity)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(BlockRecord {
            reason: fields.get(REASON_FIELD).cloned().unwrap_or_default(),
            blocked_at_millis: fields
                .get(BLOCKED_AT_FIELD)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        }))
    }

    /// Every blocked identity, sorted.
    pub async fn list_blocked(&self) -> Result<Vec<String>, BackendError> {
        let mut members = self.backend.set_members(BLOCKED_SET_KEY).await?;
        members.sort();
        Ok(members)
    }
}

/// Check one identity. `Some` means reject; backend errors admit.
pub(crate) async fn reputation_stage<B, S>(
    store: &ReputationStore<B>,
    sink: &S,
    identity: &str,
) -> Option<Rejection>
where
    B: KvBackend + ?Sized + 'static,
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    match store.is_blocked(identity).await {
        Ok(false) => None,
        Ok(true) => {
            emit_best_effort(sink.clone(), AdmissionEvent::Blocked { identity: identity.to_string() })
                .await;
            Some(Rejection::blocked())
        }
        Err(error) => {
            tracing::warn!(
                target: "gatehouse::reputation",
                identity,
                error = %error,
                "reputation backend failed; treating caller as not blocked"
            );
            emit_best_effort(sink.clone(), AdmissionEvent::FailOpen { stage: Stage::Reputation, error })
                .await;
            None
        }
    }
}

/// Rejects blocked callers with 403 before the inner service runs.
pub struct ReputationLayer<B: ?Sized, S = NullSink> {
    store: ReputationStore<B>,
    sink: S,
    trust_proxy: bool,
}

impl<B: ?Sized, S: Clone> Clone for ReputationLayer<B, S> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), sink: self.sink.clone(), trust_proxy: self.trust_proxy }
    }
}

impl<B> ReputationLayer<B>
where
    B: KvBackend + ?Sized + 'static,
{
    pub fn new(store: ReputationStore<B>) -> Self {
        Self { store, sink: NullSink, trust_proxy: false }
    }
}

impl<B: ?Sized, S> ReputationLayer<B, S> {
    pub fn with_sink<S2>(self, sink: S2) -> ReputationLayer<B, S2> {
        ReputationLayer { store: self.store, sink, trust_proxy: self.trust_proxy }
    }

    /// Identify callers by forwarded headers (see [`caller_identity`]).
    pub fn trust_proxy(mut self, trust: bool) -> Self {
        self.trust_proxy = trust;
        self
    }
}

impl<Inner, B: ?Sized, S: Clone> Layer<Inner> for ReputationLayer<B, S> {
    type Service = ReputationService<Inner, B, S>;

    fn layer(&self, inner: Inner) -> Self::Service {
        ReputationService {
            inner,
            store: self.store.clone(),
            sink: self.sink.clone(),
            trust_proxy: self.trust_proxy,
        }
    }
}

/// Service produced by [`ReputationLayer`].
pub struct ReputationService<Inner, B: ?Sized, S = NullSink> {
    inner: Inner,
    store: ReputationStore<B>,
    sink: S,
    trust_proxy: bool,
}

impl<Inner: Clone, B: ?Sized, S: Clone> Clone for ReputationService<Inner, B, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            store: self.store.clone(),
            sink: self.sink.clone(),
            trust_proxy: self.trust_proxy,
        }
    }
}

impl<Inner, B, S, Body> Service<Request<Body>> for ReputationService<Inner, B, S>
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
        let store = self.store.clone();
        let sink = self.sink.clone();
        let identity = caller_identity(&req, self.trust_proxy);
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match reputation_stage(&store, &sink, &identity).await {
                Some(rejection) => Ok(rejection.into_response()),
                None => inner.call(req).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::clock::ManualClock;
    use crate::telemetry::MemorySink;

    fn store() -> (ReputationStore<InMemoryBackend>, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let store =
            ReputationStore::new(Arc::new(backend.clone())).with_clock(ManualClock::new(42_000));
        (store, backend)
    }

    #[tokio::test]
    async fn block_and_unblock_round_trip() {
        let (store, backend) = store();
        assert!(!store.is_blocked("203.0.113.5").await.unwrap());

        store.block("203.0.113.5", "credential stuffing").await.unwrap();
        assert!(store.is_blocked("203.0.113.5").await.unwrap());
        assert_eq!(
            store.blocked_info("203.0.113.5").await.unwrap(),
            Some(BlockRecord { reason: "credential stuffing".into(), blocked_at_millis: 42_000 })
        );
        assert_eq!(store.list_blocked().await.unwrap(), vec!["203.0.113.5".to_string()]);

        store.unblock("203.0.113.5").await.unwrap();
        assert!(!store.is_blocked("203.0.113.5").await.unwrap());
        assert_eq!(store.blocked_info("203.0.113.5").await.unwrap(), None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let (store, _) = store();
        store.block("b", "x").await.unwrap();
        store.block("a", "y").await.unwrap();
        assert_eq!(store.list_blocked().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn stage_rejects_blocked_and_fails_open() {
        let (store, backend) = store();
        let sink = MemorySink::new();
        store.block("1.2.3.4", "abuse").await.unwrap();

        assert_eq!(reputation_stage(&store, &sink, "1.2.3.4").await, Some(Rejection::blocked()));
        assert_eq!(reputation_stage(&store, &sink, "5.6.7.8").await, None);

        backend.set_available(false);
        assert_eq!(reputation_stage(&store, &sink, "1.2.3.4").await, None);
        assert_eq!(sink.of_kind("blocked").len(), 1);
        assert!(matches!(
            sink.of_kind("fail_open")[..],
            [AdmissionEvent::FailOpen { stage: Stage::Reputation, .. }]
        ));
    }
}
