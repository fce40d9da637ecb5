//! Redis backend for `gatehouse` (companion crate).
//!
//! One [`RedisBackend`] per process: it holds a single multiplexed connection, opened on
//! first use and shared by every clone. A connection-level failure drops the cached
//! connection so the next call (usually the reconnect supervisor's `PING`) dials again.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use gatehouse::backend::{expiry_secs, KvBackend};
use gatehouse::{BackendError, BackendTimeout, ConfigError, GuardedBackend};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisError, RedisResult};
use std::collections::BTreeMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_DB: i64 = 0;
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

// INCR, and start the window only when this call created the key.
const WINDOW_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

/// Connection parameters, normally read from the environment.
#[derive(Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// Per-call bound applied by [`RedisBackend::guarded`].
    pub timeout: Duration,
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            password: None,
            db: DEFAULT_DB,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl RedisConfig {
    /// Read `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD`, `REDIS_DB`, and `REDIS_TIMEOUT_MS`.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidEnv`] when a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("REDIS_HOST")
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = parse_var("REDIS_PORT", lookup("REDIS_PORT"), DEFAULT_PORT)?;
        let db = parse_var("REDIS_DB", lookup("REDIS_DB"), DEFAULT_DB)?;
        let timeout_ms = parse_var("REDIS_TIMEOUT_MS", lookup("REDIS_TIMEOUT_MS"), DEFAULT_TIMEOUT_MS)?;
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidEnv { var: "REDIS_TIMEOUT_MS", value: "0".into() });
        }
        let password = lookup("REDIS_PASSWORD").filter(|p| !p.is_empty());

        Ok(Self { host, port, password, db, timeout: Duration::from_millis(timeout_ms) })
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone(),
                ..RedisConnectionInfo::default()
            },
        }
    }

    pub fn backend_timeout(&self) -> Result<BackendTimeout, ConfigError> {
        BackendTimeout::new(self.timeout)
    }
}

fn parse_var<T: FromStr>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidEnv { var, value }),
    }
}

/// [`KvBackend`] over a shared Redis connection.
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    conn: Arc<ArcSwapOption<MultiplexedConnection>>,
    window_script: Arc<redis::Script>,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("addr", &self.client.get_connection_info().addr)
            .field("connected", &self.conn.load().is_some())
            .finish()
    }
}

impl RedisBackend {
    /// Wrap an existing client. No connection is made until the first call.
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: Arc::new(ArcSwapOption::empty()),
            window_script: Arc::new(redis::Script::new(WINDOW_SCRIPT)),
        }
    }

    pub fn open(config: &RedisConfig) -> Result<Self, ConfigError> {
        redis::Client::open(config.connection_info())
            .map(Self::new)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Open from a `redis://` URL.
    pub fn open_url(url: &str) -> Result<Self, ConfigError> {
        redis::Client::open(url).map(Self::new).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Wrap in a [`GuardedBackend`] using `config.timeout` per call.
    pub fn guarded(self, config: &RedisConfig) -> Result<GuardedBackend<RedisBackend>, ConfigError> {
        Ok(GuardedBackend::new(Arc::new(self)).with_timeout(config.backend_timeout()?))
    }

    /// Drop the shared connection. A later call dials again.
    pub fn close(&self) {
        if self.conn.swap(None).is_some() {
            tracing::info!(target: "gatehouse::redis", "redis connection closed");
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BackendError> {
        if let Some(conn) = self.conn.load_full() {
            return Ok(MultiplexedConnection::clone(&conn));
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        self.conn.store(Some(Arc::new(conn.clone())));
        tracing::debug!(target: "gatehouse::redis", "redis connection established");
        Ok(conn)
    }

    fn classify(&self, error: RedisError) -> BackendError {
        if error.is_io_error()
            || error.is_connection_dropped()
            || error.is_connection_refusal()
            || error.is_timeout()
        {
            self.conn.store(None);
            BackendError::Unavailable(error.to_string())
        } else {
            BackendError::Protocol(error.to_string())
        }
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, BackendError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;
        op(conn).await.map_err(|e| self.classify(e))
    }
}

fn expiry_arg(ttl: Duration) -> i64 {
    i64::try_from(expiry_secs(ttl)).unwrap_or(i64::MAX)
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn increment(&self, key: &str) -> Result<i64, BackendError> {
        self.run(|mut c| async move { c.incr(key, 1i64).await }).await
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), BackendError> {
        self.run(|mut c| async move { c.expire(key, expiry_arg(ttl)).await }).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, BackendError> {
        // PTTL: -2 missing, -1 no expiry.
        let millis: i64 = self.run(|mut c| async move { c.pttl(key).await }).await?;
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), BackendError> {
        self.run(|mut c| async move { c.sadd(key, member).await }).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), BackendError> {
        self.run(|mut c| async move { c.srem(key, member).await }).await
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        self.run(|mut c| async move { c.sismember(key, member).await }).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BackendError> {
        self.run(|mut c| async move { c.smembers(key).await }).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BackendError> {
        self.run(|mut c| async move { c.hset(key, field, value).await }).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>, BackendError> {
        self.run(|mut c| async move { c.hgetall(key).await }).await
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, BackendError> {
        self.run(|mut c| async move { c.hincr(key, field, delta).await }).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.run(|mut c| async move { c.del(key).await }).await
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.run(|mut c| async move {
            let pong: RedisResult<String> = redis::cmd("PING").query_async(&mut c).await;
            pong.map(|_| ())
        })
        .await
    }

    async fn increment_window(&self, key: &str, window: Duration) -> Result<i64, BackendError> {
        let script = self.window_script.clone();
        self.run(|mut c| async move {
            let count: RedisResult<i64> =
                script.key(key).arg(expiry_arg(window)).invoke_async(&mut c).await;
            count
        })
        .await
    }
}
