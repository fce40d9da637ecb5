//! Key-value backend contract and connection-status model.
//!
//! Every piece of admission state (counters, the blocklist, usage hashes) lives in a shared
//! key-value store so that all service instances agree on it. This module provides:
//! - [`KvBackend`]: the async contract a store must satisfy (atomic counters, sets, hashes,
//!   expiry).
//! - [`ConnectionStatus`]: the explicit `{Connected, Degraded}` state shared by every stage.
//! - [`GuardedBackend`]: wraps a store with a timeout and the status model, so calls made
//!   while degraded fail fast instead of queueing behind a dead connection. Once per backoff
//!   interval one call is let through as a probe, so the backend recovers on its own.
//! - [`Supervisor`]: the optional process-scoped task that pings a degraded store with
//!   capped backoff, so recovery does not wait for traffic.
//!
//! Implementations: [`InMemoryBackend`] here, and `RedisBackend` in `gatehouse-redis`.

use crate::backoff::ReconnectBackoff;
use crate::error::BackendError;
use crate::timeout::BackendTimeout;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub mod memory;
pub mod supervisor;
pub use memory::InMemoryBackend;
pub use supervisor::{RecordingSleeper, Sleeper, Supervisor, SupervisorHandle, TokioSleeper};

/// Whole seconds for an expiry, rounded up and never zero.
pub fn expiry_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

/// Async contract for the shared store.
///
/// All operations are network calls in production and may fail; callers decide whether a
/// failure means "admit", "skip", or "empty".
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Atomically increment `key`, creating it at 0 first. Returns the new value.
    async fn increment(&self, key: &str) -> Result<i64, BackendError>;

    /// Expire `key` after `ttl` (whole seconds, rounded up).
    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), BackendError>;

    /// Remaining time to live; `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, BackendError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), BackendError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), BackendError>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, BackendError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BackendError>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BackendError>;

    /// All fields of a hash; empty when the key is missing.
    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>, BackendError>;

    async fn hash_increment(&self, key: &str, field: &str, delta: i64)
        -> Result<i64, BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), BackendError>;

    /// Increment a fixed-window counter, starting its expiry only when this call created it.
    ///
    /// Setting the expiry on every hit would keep pushing the window out; only the first
    /// hit in a window (count == 1) starts the clock. Stores that can do both steps in one
    /// atomic round trip should override this.
    async fn increment_window(&self, key: &str, window: Duration) -> Result<i64, BackendError> {
        let count = self.increment(key).await?;
        if count == 1 {
            self.set_expiry(key, window).await?;
        }
        Ok(count)
    }
}

/// The two connection states every backend consumer reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Calls go to the backend.
    Connected,
    /// The backend recently failed; calls fail fast and admission fails open until a probe
    /// succeeds.
    Degraded,
}

/// Shared, observable connection state. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Connected);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn is_degraded(&self) -> bool {
        self.state() == ConnectionState::Degraded
    }

    /// Move to `Degraded`. Returns `true` if this call performed the transition.
    pub fn mark_degraded(&self, cause: &BackendError) -> bool {
        let changed = self.transition(ConnectionState::Degraded);
        if changed {
            tracing::warn!(
                target: "gatehouse::backend",
                error = %cause,
                "backend degraded; admission will fail open until it recovers"
            );
        }
        changed
    }

    /// Move to `Connected`. Returns `true` if this call performed the transition.
    pub fn mark_connected(&self) -> bool {
        let changed = self.transition(ConnectionState::Connected);
        if changed {
            tracing::info!(target: "gatehouse::backend", "backend connection restored");
        }
        changed
    }

    fn transition(&self, to: ConnectionState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == to {
                false
            } else {
                *state = to;
                true
            }
        })
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct ProbeSchedule {
    attempt: usize,
    next_at: Instant,
}

/// A backend wrapped with a call timeout and the shared connection status.
///
/// This is the handle services build once at startup and pass to every layer. While
/// degraded, the first call after each backoff interval goes to the backend as a probe;
/// every other call fails fast. A probe that reaches the backend restores `Connected`.
pub struct GuardedBackend<B: ?Sized> {
    inner: Arc<B>,
    status: ConnectionStatus,
    timeout: BackendTimeout,
    backoff: ReconnectBackoff,
    probe: Arc<Mutex<ProbeSchedule>>,
}

impl<B: ?Sized> Clone for GuardedBackend<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            status: self.status.clone(),
            timeout: self.timeout,
            backoff: self.backoff,
            probe: self.probe.clone(),
        }
    }
}

impl<B: ?Sized> std::fmt::Debug for GuardedBackend<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedBackend")
            .field("state", &self.status.state())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<B> GuardedBackend<B>
where
    B: KvBackend + ?Sized + 'static,
{
    pub fn new(inner: Arc<B>) -> Self {
        Self {
            inner,
            status: ConnectionStatus::new(),
            timeout: BackendTimeout::default(),
            backoff: ReconnectBackoff::default(),
            probe: Arc::new(Mutex::new(ProbeSchedule { attempt: 0, next_at: Instant::now() })),
        }
    }

    pub fn with_timeout(mut self, timeout: BackendTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Spacing between probes while degraded (also used by [`supervisor`](Self::supervisor)).
    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn inner(&self) -> &Arc<B> {
        &self.inner
    }

    /// Build the reconnect supervisor for this backend (not yet running).
    pub fn supervisor(&self) -> Supervisor<B> {
        Supervisor::new(self.inner.clone(), self.status.clone())
            .with_timeout(self.timeout)
            .with_backoff(self.backoff)
    }

    /// Start the default supervisor on the current runtime.
    ///
    /// Supervision stops when the handle is dropped; hold it for the life of the process.
    #[must_use = "dropping the handle stops the supervisor"]
    pub fn spawn_supervisor(&self) -> SupervisorHandle {
        self.supervisor().spawn()
    }

    fn schedule(&self) -> std::sync::MutexGuard<'_, ProbeSchedule> {
        self.probe.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Claim the next probe slot if its backoff has elapsed.
    fn claim_probe(&self) -> bool {
        let mut schedule = self.schedule();
        let now = Instant::now();
        if now < schedule.next_at {
            return false;
        }
        schedule.attempt = schedule.attempt.saturating_add(1);
        schedule.next_at = now + self.backoff.delay(schedule.attempt);
        true
    }

    fn restart_probe_schedule(&self) {
        let mut schedule = self.schedule();
        schedule.attempt = 1;
        schedule.next_at = Instant::now() + self.backoff.delay(1);
    }

    async fn guarded<T, F>(&self, call: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>> + Send,
    {
        let probing = self.status.is_degraded();
        if probing && !self.claim_probe() {
            return Err(BackendError::Degraded);
        }
        match self.timeout.run(call).await {
            Err(e) if e.is_connectivity() => {
                if self.status.mark_degraded(&e) {
                    self.restart_probe_schedule();
                } else if probing {
                    tracing::debug!(target: "gatehouse::backend", error = %e, "in-band probe failed");
                }
                Err(e)
            }
            // Any answer, even a protocol error, means the backend is reachable.
            other => {
                if probing {
                    self.status.mark_connected();
                }
                other
            }
        }
    }
}

#[async_trait]
impl<B> KvBackend for GuardedBackend<B>
where
    B: KvBackend + ?Sized + 'static,
{
    async fn increment(&self, key: &str) -> Result<i64, BackendError> {
        self.guarded(self.inner.increment(key)).await
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), BackendError> {
        self.guarded(self.inner.set_expiry(key, ttl)).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, BackendError> {
        self.guarded(self.inner.ttl(key)).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), BackendError> {
        self.guarded(self.inner.set_add(key, member)).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), BackendError> {
        self.guarded(self.inner.set_remove(key, member)).await
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        self.guarded(self.inner.set_contains(key, member)).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BackendError> {
        self.guarded(self.inner.set_members(key)).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BackendError> {
        self.guarded(self.inner.hash_set(key, field, value)).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>, BackendError> {
        self.guarded(self.inner.hash_get_all(key)).await
    }

    async fn hash_increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, BackendError> {
        self.guarded(self.inner.hash_increment(key, field, delta)).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.guarded(self.inner.delete(key)).await
    }

    // Probes go straight through; the supervisor needs them while degraded.
    async fn ping(&self) -> Result<(), BackendError> {
        self.timeout.run(self.inner.ping()).await
    }

    async fn increment_window(&self, key: &str, window: Duration) -> Result<i64, BackendError> {
        self.guarded(self.inner.increment_window(key, window)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn expiry_rounds_up_to_whole_seconds() {
        assert_eq!(expiry_secs(Duration::from_millis(1)), 1);
        assert_eq!(expiry_secs(Duration::from_millis(1500)), 2);
        assert_eq!(expiry_secs(Duration::from_secs(60)), 60);
        assert_eq!(expiry_secs(Duration::ZERO), 1);
    }

    #[test]
    fn status_transitions_report_changes_once() {
        let status = ConnectionStatus::new();
        assert_eq!(status.state(), ConnectionState::Connected);
        let cause = BackendError::Unavailable("refused".into());
        assert!(status.mark_degraded(&cause));
        assert!(!status.mark_degraded(&cause));
        assert!(status.clone().is_degraded());
        assert!(status.mark_connected());
        assert!(!status.mark_connected());
    }

    #[tokio::test]
    async fn guarded_backend_degrades_and_fails_fast() {
        let memory = InMemoryBackend::with_clock(ManualClock::new(0));
        let guarded = GuardedBackend::new(Arc::new(memory.clone()));

        assert_eq!(guarded.increment("k").await, Ok(1));
        memory.set_available(false);
        assert!(matches!(guarded.increment("k").await, Err(BackendError::Unavailable(_))));
        assert!(guarded.status().is_degraded());

        // Recovered store is not used until the status flips back.
        memory.set_available(true);
        assert_eq!(guarded.increment("k").await, Err(BackendError::Degraded));
        assert_eq!(guarded.ping().await, Ok(()));
        guarded.status().mark_connected();
        assert_eq!(guarded.increment("k").await, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn guarded_backend_times_out_slow_calls() {
        let memory = InMemoryBackend::new();
        memory.set_latency(Some(Duration::from_secs(5)));
        let guarded = GuardedBackend::new(Arc::new(memory))
            .with_timeout(BackendTimeout::new(Duration::from_millis(100)).unwrap());

        let err = guarded.increment("slow").await.unwrap_err();
        assert!(err.is_timeout());
        assert!(guarded.status().is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_in_band_after_the_supervisor_is_dropped() {
        let memory = InMemoryBackend::new();
        let guarded = GuardedBackend::new(Arc::new(memory.clone()));
        drop(guarded.spawn_supervisor());

        memory.set_available(false);
        assert!(guarded.increment("k").await.is_err());
        memory.set_available(true);
        assert_eq!(guarded.increment("k").await, Err(BackendError::Degraded));

        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert_eq!(guarded.status().state(), ConnectionState::Degraded);
        assert_eq!(guarded.increment("k").await, Ok(1));
        assert_eq!(guarded.status().state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_calls_pass_through_once_per_backoff_step() {
        let memory = InMemoryBackend::new();
        memory.set_available(false);
        let guarded = GuardedBackend::new(Arc::new(memory.clone()));

        assert!(matches!(guarded.increment("k").await, Err(BackendError::Unavailable(_))));
        assert_eq!(guarded.increment("k").await, Err(BackendError::Degraded));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(guarded.increment("k").await, Err(BackendError::Unavailable(_))));
        assert_eq!(guarded.increment("k").await, Err(BackendError::Degraded));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(guarded.increment("k").await, Err(BackendError::Degraded));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(guarded.increment("k").await, Err(BackendError::Unavailable(_))));
        assert!(guarded.status().is_degraded());
    }

    #[tokio::test]
    async fn protocol_errors_do_not_degrade() {
        let memory = InMemoryBackend::new();
        memory.hash_set("h", "f", "v").await.unwrap();
        let guarded = GuardedBackend::new(Arc::new(memory));
        assert!(matches!(guarded.increment("h").await, Err(BackendError::Protocol(_))));
        assert!(!guarded.status().is_degraded());
    }
}
