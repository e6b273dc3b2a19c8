use crate::session::AuthenticatedSession;
use async_trait::async_trait;
use oauth2::url::Url;
use dashmap::{mapref::entry::Entry, DashMap};
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult, Script};
use std::{
    future::Future,
    sync::Mutex,
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Failed to (de)serialize session: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Shared key/value counters with an atomic conditional write.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes `new` with `ttl` only if the current value equals `expected`,
    /// where `None` means the key must be absent. Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

/// Server-side sessions keyed by the opaque id carried in the session cookie.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<AuthenticatedSession>, StoreError>;
    async fn save(
        &self,
        session_id: &str,
        session: &AuthenticatedSession,
    ) -> Result<(), StoreError>;
    async fn invalidate(&self, session_id: &str) -> Result<(), StoreError>;
}

const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current then
        return 0
    end
elseif current ~= ARGV[2] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
"#;

/// Redis backed counters and sessions sharing one multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    timeout: Duration,
    session_ttl: Duration,
    cas_script: Script,
}

impl RedisStore {
    const SESSION_KEY_PREFIX: &'static str = "bff:session:";

    pub async fn connect(
        url: &str,
        timeout: Duration,
        session_ttl: Duration,
    ) -> Result<Self, StoreError> {
        log::info!("Connecting to Redis at {}.", sanitize_url(url));
        let client = Client::open(url)?;
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;

        Ok(Self {
            connection,
            timeout,
            session_ttl,
            cas_script: Script::new(COMPARE_AND_SWAP_SCRIPT),
        })
    }

    async fn bounded<T>(&self, operation: impl Future<Output = RedisResult<T>>) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, operation)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
            .map_err(StoreError::from)
    }

    fn session_key(session_id: &str) -> String {
        format!("{}{}", Self::SESSION_KEY_PREFIX, session_id)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut connection = self.connection.clone();
        self.bounded(connection.get(key)).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let expect_absent = if expected.is_none() { "1" } else { "0" };
        let ttl_millis = ttl.as_millis().max(1) as u64;
        let swapped: i64 = self
            .bounded(
                self.cas_script
                    .key(key)
                    .arg(expect_absent)
                    .arg(expected.unwrap_or_default())
                    .arg(new)
                    .arg(ttl_millis)
                    .invoke_async(&mut connection),
            )
            .await?;
        Ok(swapped == 1)
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn get(&self, session_id: &str) -> Result<Option<AuthenticatedSession>, StoreError> {
        let mut connection = self.connection.clone();
        let value: Option<String> = self
            .bounded(connection.get(Self::session_key(session_id)))
            .await?;
        value
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn save(
        &self,
        session_id: &str,
        session: &AuthenticatedSession,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(session)?;
        let mut connection = self.connection.clone();
        self.bounded(connection.set_ex::<_, _, ()>(
            Self::session_key(session_id),
            json,
            self.session_ttl.as_secs().max(1),
        ))
        .await
    }

    async fn invalidate(&self, session_id: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        self.bounded(connection.del::<_, ()>(Self::session_key(session_id)))
            .await
    }
}

/// Hides the password part of a connection string before it is logged.
pub(crate) fn sanitize_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

/// Entries with a deadline. Expired entries are invisible at once and removed by a
/// sweep that runs on writes, at most once per `sweep_interval`.
struct ExpiringMap<V> {
    entries: DashMap<String, (V, Instant)>,
    sweep_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl<V: Clone> ExpiringMap<V> {
    const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

    fn new(sweep_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            sweep_interval,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    fn get(&self, key: &str, now: Instant) -> Option<V> {
        self.entries
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone())
    }

    fn insert(&self, key: &str, value: V, expires_at: Instant) {
        self.entries.insert(key.to_string(), (value, expires_at));
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    fn sweep(&self, now: Instant) {
        // Another writer is already sweeping.
        let Ok(mut last_sweep) = self.last_sweep.try_lock() else {
            return;
        };
        if now.duration_since(*last_sweep) < self.sweep_interval {
            return;
        }
        *last_sweep = now;

        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        log::debug!(
            "Swept {} expired entries, {} left.",
            before.saturating_sub(self.entries.len()),
            self.entries.len()
        );
    }
}

/// Process local counters for single-instance deployments and tests.
pub struct InMemoryCounterStore {
    counters: ExpiringMap<String>,
}

impl InMemoryCounterStore {
    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            counters: ExpiringMap::new(sweep_interval),
        }
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::with_sweep_interval(ExpiringMap::<String>::SWEEP_INTERVAL)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.counters.get(key, Instant::now()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        // The entry guard holds the shard lock, making check and write one step.
        let swapped = match self.counters.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let (value, expires_at) = occupied.get();
                let current = (*expires_at > now).then_some(value.as_str());
                if current == expected {
                    occupied.insert((new.to_string(), now + ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert((new.to_string(), now + ttl));
                    true
                } else {
                    false
                }
            }
        };

        self.counters.sweep(now);
        Ok(swapped)
    }
}

/// Process local sessions, lost on restart.
pub struct InMemorySessionStore {
    ttl: Duration,
    sessions: ExpiringMap<AuthenticatedSession>,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_sweep_interval(ttl, ExpiringMap::<AuthenticatedSession>::SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            ttl,
            sessions: ExpiringMap::new(sweep_interval),
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<AuthenticatedSession>, StoreError> {
        Ok(self.sessions.get(session_id, Instant::now()))
    }

    async fn save(
        &self,
        session_id: &str,
        session: &AuthenticatedSession,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        self.sessions.insert(session_id, session.clone(), now + self.ttl);
        self.sessions.sweep(now);
        Ok(())
    }

    async fn invalidate(&self, session_id: &str) -> Result<(), StoreError> {
        self.sessions.remove(session_id);
        Ok(())
    }
}
