use super::{expiry_secs, KvBackend};
use crate::clock::{Clock, SystemClock};
use crate::error::BackendError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_millis: Option<u64>,
}

// Expired entries are swept from the whole map at most this often.
const SWEEP_INTERVAL_MILLIS: u64 = 1_000;

fn wrong_type(key: &str) -> BackendError {
    BackendError::Protocol(format!("WRONGTYPE operation against key {key:?}"))
}

/// Single-process key-value store with clock-driven expiry.
///
/// Serves as the test double for every admission stage and as a backend for
/// single-instance deployments. Clones share state. Outages and slow calls can be
/// injected with [`set_available`](Self::set_available) and
/// [`set_latency`](Self::set_latency).
///
/// Expired keys are dropped when touched and by a periodic sweep of the whole map, so
/// memory tracks the live key set rather than every key ever written.
#[derive(Clone, Debug)]
pub struct InMemoryBackend {
    data: Arc<Mutex<HashMap<String, Entry>>>,
    next_sweep_millis: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
    available: Arc<AtomicBool>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            next_sweep_millis: Arc::new(AtomicU64::new(0)),
            clock: Arc::new(clock),
            available: Arc::new(AtomicBool::new(true)),
            latency: Arc::new(Mutex::new(None)),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it runs.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|p| p.into_inner()) = latency;
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock().values().filter(|e| !Self::expired(e, now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn expired(entry: &Entry, now: u64) -> bool {
        entry.expires_at_millis.is_some_and(|at| at <= now)
    }

    async fn enter(&self) -> Result<(), BackendError> {
        let latency = *self.latency.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("in-memory backend marked unavailable".into()))
        }
    }

    /// Run `f` against the live entry for `key` (expired entries are purged first).
    fn with_entry<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>, u64) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        if now >= self.next_sweep_millis.load(Ordering::Relaxed) {
            self.sweep(&mut guard, now);
        } else if guard.get(key).is_some_and(|e| Self::expired(e, now)) {
            guard.remove(key);
        }
        f(&mut guard, now)
    }

    fn sweep(&self, data: &mut HashMap<String, Entry>, now: u64) {
        let before = data.len();
        data.retain(|_, e| !Self::expired(e, now));
        self.next_sweep_millis.store(now.saturating_add(SWEEP_INTERVAL_MILLIS), Ordering::Relaxed);
        let swept = before - data.len();
        if swept > 0 {
            tracing::trace!(target: "gatehouse::backend", swept, remaining = data.len(), "swept expired keys");
        }
    }

    #[cfg(test)]
    fn stored(&self) -> usize {
        self.lock().len()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for InMemoryBackend {
    async fn increment(&self, key: &str) -> Result<i64, BackendError> {
        self.enter().await?;
        self.with_entry(key, |data, _| {
            let entry = data
                .entry(key.to_string())
                .or_insert_with(|| Entry { value: Value::Counter(0), expires_at_millis: None });
            match &mut entry.value {
                Value::Counter(n) => {
                    *n = n.saturating_add(1);
                    Ok(*n)
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), BackendError> {
        self.enter().await?;
        self.with_entry(key, |data, now| {
            if let Some(entry) = data.get_mut(key) {
                entry.expires_at_millis = Some(now + expiry_secs(ttl) * 1000);
            }
            Ok(())
        })
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, BackendError> {
        self.enter().await?;
        self.with_entry(key, |data, now| {
            Ok(data
                .get(key)
                .and_then(|e| e.expires_at_millis)
                .map(|at| Duration::from_millis(at.saturating_sub(now))))
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), BackendError> {
        self.enter().await?;
        self.with_entry(key, |data, _| {
            let entry = data
                .entry(key.to_string())
                .or_insert_with(|| Entry { value: Value::Set(BTreeSet::new()), expires_at_millis: None });
            match &mut entry.value {
                Value::Set(set) => {
                    set.insert(member.to_string());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), BackendError> {
        self.enter().await?;
        self.with_entry(key, |data, _| {
            let now_empty = match data.get_mut(key) {
                None => return Ok(()),
                Some(Entry { value: Value::Set(set), .. }) => {
                    set.remove(member);
                    set.is_empty()
                }
                Some(_) => return Err(wrong_type(key)),
            };
            if now_empty {
                data.remove(key);
            }
            Ok(())
        })
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        self.enter().await?;
        self.with_entry(key, |data, _| match data.get(key) {
            None => Ok(false),
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.contains(member)),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BackendError> {
        self.enter().await?;
        self.with_entry(key, |data, _| match data.get(key) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BackendError> {
        self.enter().await?;
        self.with_entry(key, |data, _| {
            let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(BTreeMap::new()),
                expires_at_millis: None,
            });
            match &mut entry.value {
                Value::Hash(hash) => {
                    hash.insert(field.to_string(), value.to_string());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>, BackendError> {
        self.enter().await?;
        self.with_entry(key, |data, _| match data.get(key) {
            None => Ok(BTreeMap::new()),
            Some(Entry { value: Value::Hash(hash), .. }) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hash_increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, BackendError> {
        self.enter().await?;
        self.with_entry(key, |data, _| {
            let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(BTreeMap::new()),
                expires_at_millis: None,
            });
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            let current = match hash.get(field) {
                Some(raw) => raw.parse::<i64>().map_err(|_| {
                    BackendError::Protocol(format!("hash value at {key:?}.{field:?} is not an integer"))
                })?,
                None => 0,
            };
            let next = current.saturating_add(delta);
            hash.insert(field.to_string(), next.to_string());
            Ok(next)
        })
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.enter().await?;
        self.lock().remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.enter().await
    }
}
