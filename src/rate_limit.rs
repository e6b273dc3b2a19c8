use crate::{
    route::{
        API_SCOPE, AUTHORIZATION_PREFIX, AUTH_LOGOUT_PATH, AUTH_SCOPE, CALLBACK_PREFIX,
        HEALTH_PATH,
    },
    store::{CounterStore, StoreError},
};
use chrono::{DateTime, TimeDelta, Utc};
use std::{fmt, num::NonZeroU32, sync::Arc, time::Duration};

/// Coarse endpoint category used to pick a [`BucketPolicy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Auth,
    ApiAuthenticated,
    ApiAnonymous,
}

impl RouteClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Auth => "auth",
            RouteClass::ApiAuthenticated => "api-authenticated",
            RouteClass::ApiAnonymous => "api-anonymous",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{route-class}:{identity}`, where identity is a client IP or a session id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    route_class: RouteClass,
    identity: String,
}

impl RateLimitKey {
    pub fn new(route_class: RouteClass, identity: impl Into<String>) -> Self {
        Self {
            route_class,
            identity: identity.into(),
        }
    }

    pub fn route_class(&self) -> RouteClass {
        self.route_class
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.route_class, self.identity)
    }
}

/// Interval refill: the bucket is reset to `capacity` at the start of every
/// `refill_period`, each request consumes one unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketPolicy {
    pub capacity: NonZeroU32,
    pub refill_period: Duration,
}

impl BucketPolicy {
    pub fn new(capacity: NonZeroU32, refill_period: Duration) -> Self {
        Self {
            capacity,
            refill_period,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicies {
    pub auth: BucketPolicy,
    pub api_authenticated: BucketPolicy,
    pub api_anonymous: BucketPolicy,
}

impl RateLimitPolicies {
    pub fn for_class(&self, route_class: RouteClass) -> BucketPolicy {
        match route_class {
            RouteClass::Auth => self.auth,
            RouteClass::ApiAuthenticated => self.api_authenticated,
            RouteClass::ApiAnonymous => self.api_anonymous,
        }
    }
}

/// Who is calling. `session_id` is only set when the session exists in the store.
#[derive(Clone, Debug, Default)]
pub struct IdentitySource {
    pub client_ip: String,
    pub session_id: Option<String>,
}

/// Maps a request path to the bucket that governs it, `None` when the path is exempt.
pub fn classify(path: &str, identity: &IdentitySource) -> Option<RateLimitKey> {
    // The session is already gone by the time logout runs; retries must not be punished.
    if path == AUTH_LOGOUT_PATH {
        return None;
    }
    if path == HEALTH_PATH
        || path.starts_with(CALLBACK_PREFIX)
        || path.starts_with(AUTHORIZATION_PREFIX)
    {
        return None;
    }
    if in_namespace(path, AUTH_SCOPE) {
        return Some(RateLimitKey::new(RouteClass::Auth, &identity.client_ip));
    }
    if in_namespace(path, API_SCOPE) {
        return Some(match &identity.session_id {
            Some(session_id) => RateLimitKey::new(RouteClass::ApiAuthenticated, session_id),
            None => RateLimitKey::new(RouteClass::ApiAnonymous, &identity.client_ip),
        });
    }
    None
}

/// `true` for `namespace` itself and anything below it, `/apiary` is not under `/api`.
pub(crate) fn in_namespace(path: &str, namespace: &str) -> bool {
    path.strip_prefix(namespace)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Bucket {
    remaining: u32,
    window_expiry: DateTime<Utc>,
}

impl Bucket {
    fn fresh(policy: &BucketPolicy, now: DateTime<Utc>) -> Self {
        let period = TimeDelta::from_std(policy.refill_period).unwrap_or(TimeDelta::MAX);
        Self {
            remaining: policy.capacity.get(),
            window_expiry: now
                .checked_add_signed(period)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_expiry
    }

    fn ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.window_expiry - now).to_std().unwrap_or_default()
    }

    fn encode(&self) -> String {
        format!(
            "{}:{}",
            self.remaining,
            self.window_expiry.timestamp_millis()
        )
    }

    fn decode(value: &str) -> Option<Self> {
        let (remaining, expiry) = value.split_once(':')?;
        Some(Self {
            remaining: remaining.parse().ok()?,
            window_expiry: DateTime::from_timestamp_millis(expiry.parse().ok()?)?,
        })
    }
}

/// Token buckets kept in a shared [`CounterStore`], updated with compare-and-swap.
pub struct TokenBucketLimiter {
    store: Arc<dyn CounterStore>,
    max_attempts: u32,
}

impl TokenBucketLimiter {
    const KEY_PREFIX: &'static str = "rate_limit";
    const MAX_CAS_ATTEMPTS: u32 = 5;
    /// Buckets outlive their window by this much so an expired window is still readable.
    const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            max_attempts: Self::MAX_CAS_ATTEMPTS,
        }
    }

    /// Consumes one unit from the bucket behind `key`. Returns `false` when the bucket
    /// is empty or when contention outlasted the retry budget.
    pub async fn try_consume(
        &self,
        key: &RateLimitKey,
        policy: &BucketPolicy,
    ) -> Result<bool, StoreError> {
        self.try_consume_at(key, policy, Utc::now()).await
    }

    pub(crate) async fn try_consume_at(
        &self,
        key: &RateLimitKey,
        policy: &BucketPolicy,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let store_key = format!("{}:{}", Self::KEY_PREFIX, key);

        for attempt in 1..=self.max_attempts {
            let current = self.store.get(&store_key).await?;
            let bucket = current
                .as_deref()
                .and_then(Bucket::decode)
                .filter(|bucket| !bucket.is_expired(now));

            let next = match bucket {
                Some(bucket) if bucket.remaining == 0 => return Ok(false),
                Some(bucket) => Bucket {
                    remaining: bucket.remaining - 1,
                    ..bucket
                },
                None => {
                    let fresh = Bucket::fresh(policy, now);
                    Bucket {
                        remaining: fresh.remaining - 1,
                        ..fresh
                    }
                }
            };

            let ttl = next.ttl(now) + Self::EXPIRY_MARGIN;
            if self
                .store
                .compare_and_swap(&store_key, current.as_deref(), &next.encode(), ttl)
                .await?
            {
                return Ok(true);
            }
            log::debug!(
                "Bucket for {} changed concurrently, retrying ({}/{}).",
                key.route_class(),
                attempt,
                self.max_attempts
            );
        }

        log::warn!(
            "Gave up on contended bucket for {} after {} attempts, denying.",
            key.route_class(),
            self.max_attempts
        );
        Ok(false)
    }
}
