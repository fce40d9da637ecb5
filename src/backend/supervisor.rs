//! Reconnect supervision for a degraded backend.

use super::{ConnectionState, ConnectionStatus, KvBackend};
use crate::backoff::ReconnectBackoff;
use crate::timeout::BackendTimeout;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Abstraction for waiting between probes, so tests need not wait in real time.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Records every requested delay and only yields to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(duration);
        Box::pin(tokio::task::yield_now())
    }
}

/// Probes a degraded backend until it answers, then flips the status back to `Connected`.
///
/// One supervisor per backend per process. It never gives up: the backoff caps the delay
/// between probes, not the number of probes. Without one, a [`GuardedBackend`] still
/// recovers through its in-band probes, but only when traffic arrives.
///
/// [`GuardedBackend`]: super::GuardedBackend
pub struct Supervisor<B: ?Sized> {
    backend: Arc<B>,
    status: ConnectionStatus,
    backoff: ReconnectBackoff,
    timeout: BackendTimeout,
    sleeper: Arc<dyn Sleeper>,
}

impl<B> Supervisor<B>
where
    B: KvBackend + ?Sized + 'static,
{
    pub fn new(backend: Arc<B>, status: ConnectionStatus) -> Self {
        Self {
            backend,
            status,
            backoff: ReconnectBackoff::default(),
            timeout: BackendTimeout::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: BackendTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Run until the status channel closes.
    pub async fn run(self) {
        let mut rx = self.status.subscribe();
        loop {
            let woke = rx.wait_for(|s| *s == ConnectionState::Degraded).await.map(|_| ());
            if woke.is_err() {
                return;
            }
            self.recover().await;
        }
    }

    async fn recover(&self) {
        let mut attempt = 0usize;
        loop {
            self.sleeper.sleep(self.backoff.delay(attempt)).await;
            match self.timeout.run(self.backend.ping()).await {
                Ok(()) => {
                    tracing::debug!(target: "gatehouse::backend", attempt, "reconnect probe succeeded");
                    self.status.mark_connected();
                    return;
                }
                Err(e) => {
                    tracing::debug!(
                        target: "gatehouse::backend",
                        attempt,
                        error = %e,
                        "reconnect probe failed"
                    );
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Spawn onto the current tokio runtime.
    #[must_use = "dropping the handle stops the supervisor"]
    pub fn spawn(self) -> SupervisorHandle {
        SupervisorHandle { task: tokio::spawn(self.run()) }
    }
}

/// Owns the spawned supervisor task; dropping or shutting it down stops supervision.
#[derive(Debug)]
#[must_use = "dropping the handle stops the supervisor"]
pub struct SupervisorHandle {
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn shutdown(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GuardedBackend, InMemoryBackend};
    use crate::error::BackendError;

    #[tokio::test]
    async fn probes_with_linear_backoff_until_backend_returns() {
        let memory = InMemoryBackend::new();
        memory.set_available(false);
        let status = ConnectionStatus::new();
        status.mark_degraded(&BackendError::Unavailable("refused".into()));

        let sleeper = RecordingSleeper::new();
        let handle = Supervisor::new(Arc::new(memory.clone()), status.clone())
            .with_sleeper(sleeper.clone())
            .spawn();

        while sleeper.calls().len() < 4 {
            tokio::task::yield_now().await;
        }
        memory.set_available(true);

        let mut rx = status.subscribe();
        rx.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();

        let calls = sleeper.calls();
        assert_eq!(&calls[..4], &[
            Duration::ZERO,
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_millis(150),
        ]);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn guarded_backend_recovers_through_its_supervisor() {
        let memory = InMemoryBackend::new();
        let guarded = GuardedBackend::new(Arc::new(memory.clone()));
        let _handle = guarded.supervisor().spawn();

        memory.set_available(false);
        assert!(guarded.increment("k").await.is_err());
        assert!(guarded.status().is_degraded());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(guarded.status().is_degraded(), "still down, still degraded");

        memory.set_available(true);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(guarded.status().state(), ConnectionState::Connected);
        assert_eq!(guarded.increment("k").await, Ok(1));
    }
}
