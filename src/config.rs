use crate::{
    env_var,
    rate_limit::{BucketPolicy, RateLimitPolicies},
};
use oauth2::url::Url;
use std::{
    env::{self, VarError},
    fmt::{self, Display},
    num::{NonZeroU32, NonZeroU64},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Relying-party settings for the identity provider.
#[derive(Clone, Debug)]
pub struct OidcSettings {
    pub issuer_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub post_logout_redirect_uri: String,
    pub scopes: Vec<String>,
}

/// AES-256 key for the login challenge cookies, exactly 32 bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for EncryptionKey {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        <[u8; 32]>::try_from(value.as_bytes())
            .map(Self)
            .map_err(|_| format!("must be 32 characters long, got {}", value.len()))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

#[derive(Clone, Debug)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub policies: RateLimitPolicies,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub oidc: OidcSettings,
    pub frontend_url: Url,
    pub bind_address: String,
    pub resource_server_url: Url,
    pub resource_server_timeout: Duration,
    pub idp_timeout: Duration,
    pub max_body_bytes: usize,
    pub redis_url: Option<String>,
    pub redis_timeout: Duration,
    pub session_lifetime: Duration,
    /// Without a key one is generated per process.
    pub encryption_key: Option<EncryptionKey>,
    pub rate_limit: RateLimitSettings,
}

impl GatewayConfig {
    const DEFAULT_FRONTEND_URL: &'static str = "http://localhost:5173";
    const DEFAULT_BFF_BASE_URL: &'static str = "http://localhost:8888";
    const DEFAULT_BIND_ADDRESS: &'static str = "0.0.0.0:8888";
    const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name))
    }

    /// Builds the configuration from any variable source, `env::var` in production.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let frontend_url = url(
            env_var::FRONTEND_URL,
            optional(&lookup, env_var::FRONTEND_URL)
                .unwrap_or_else(|| Self::DEFAULT_FRONTEND_URL.to_string()),
        )?;
        let bff_base_url = optional(&lookup, env_var::BFF_BASE_URL)
            .unwrap_or_else(|| Self::DEFAULT_BFF_BASE_URL.to_string());
        let frontend_base = frontend_url.as_str().trim_end_matches('/').to_string();

        let oidc = OidcSettings {
            issuer_url: required(&lookup, env_var::AUTHORITY)?,
            client_id: required(&lookup, env_var::CLIENT_ID)?,
            client_secret: optional(&lookup, env_var::CLIENT_SECRET),
            redirect_uri: url_string(
                env_var::REDIRECT_URI,
                optional(&lookup, env_var::REDIRECT_URI).unwrap_or_else(|| {
                    format!(
                        "{}/bff/login/oauth2/code/idp",
                        bff_base_url.trim_end_matches('/')
                    )
                }),
            )?,
            post_logout_redirect_uri: url_string(
                env_var::POST_LOGOUT_REDIRECT_URI,
                optional(&lookup, env_var::POST_LOGOUT_REDIRECT_URI)
                    .unwrap_or_else(|| format!("{}/logout-complete", frontend_base)),
            )?,
            scopes: make_scopes(lookup(env_var::OIDC_SCOPES)),
        };

        let refill_period = Duration::from_secs(parsed(
            &lookup,
            env_var::RATE_LIMIT_REFILL_SECONDS,
            NonZeroU32::new(60).unwrap_or(NonZeroU32::MIN),
        )?
        .get()
        .into());
        let policy = |name: &'static str, default: u32| -> Result<BucketPolicy, ConfigError> {
            let capacity = parsed(
                &lookup,
                name,
                NonZeroU32::new(default).unwrap_or(NonZeroU32::MIN),
            )?;
            Ok(BucketPolicy::new(capacity, refill_period))
        };
        let rate_limit = RateLimitSettings {
            enabled: parsed(&lookup, env_var::RATE_LIMIT_ENABLED, true)?,
            policies: RateLimitPolicies {
                auth: policy(env_var::RATE_LIMIT_AUTH_RPM, 30)?,
                api_authenticated: policy(env_var::RATE_LIMIT_API_AUTHENTICATED_RPM, 200)?,
                api_anonymous: policy(env_var::RATE_LIMIT_API_ANONYMOUS_RPM, 60)?,
            },
        };

        Ok(Self {
            oidc,
            frontend_url,
            bind_address: optional(&lookup, env_var::BIND_ADDRESS)
                .unwrap_or_else(|| Self::DEFAULT_BIND_ADDRESS.to_string()),
            resource_server_url: url(
                env_var::RESOURCE_SERVER_URL,
                required(&lookup, env_var::RESOURCE_SERVER_URL)?,
            )?,
            resource_server_timeout: Duration::from_secs(
                positive(&lookup, env_var::RESOURCE_SERVER_TIMEOUT_SECONDS, 30)?,
            ),
            idp_timeout: Duration::from_secs(positive(&lookup, env_var::IDP_TIMEOUT_SECONDS, 10)?),
            max_body_bytes: parsed(
                &lookup,
                env_var::PROXY_MAX_BODY_BYTES,
                Self::DEFAULT_MAX_BODY_BYTES,
            )?,
            redis_url: optional(&lookup, env_var::REDIS_URL),
            redis_timeout: Duration::from_millis(positive(
                &lookup,
                env_var::REDIS_TIMEOUT_MILLIS,
                2000,
            )?),
            session_lifetime: Duration::from_secs(positive(
                &lookup,
                env_var::SESSION_LIFETIME_SECONDS,
                1800,
            )?),
            encryption_key: optional(&lookup, env_var::ENCRYPTION_KEY)
                .map(|value| {
                    value
                        .parse::<EncryptionKey>()
                        .map_err(|reason| ConfigError::Invalid {
                            name: env_var::ENCRYPTION_KEY,
                            value: "<redacted>".to_string(),
                            reason,
                        })
                })
                .transpose()?,
            rate_limit,
        })
    }
}

fn optional<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    lookup(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    optional(lookup, name).ok_or(ConfigError::Missing(name))
}

fn parsed<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
    T: FromStr,
    T::Err: Display,
{
    match optional(lookup, name) {
        Some(value) => value.parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            reason: err.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

/// Durations and sizes where zero would make every call fail.
fn positive<F>(lookup: &F, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    let fallback = NonZeroU64::new(default).unwrap_or(NonZeroU64::MIN);
    Ok(parsed(lookup, name, fallback)?.get())
}

/// Keeps the configured spelling, only checks that it parses.
fn url_string(name: &'static str, value: String) -> Result<String, ConfigError> {
    url(name, value.clone())?;
    Ok(value)
}

fn url(name: &'static str, value: String) -> Result<Url, ConfigError> {
    Url::parse(&value).map_err(|err| ConfigError::Invalid {
        name,
        reason: err.to_string(),
        value,
    })
}

/// `openid` is always requested. Without an explicit list `profile` and `email` are added.
fn make_scopes(scopes: Result<String, VarError>) -> Vec<String> {
    let mut result = vec!["openid".to_string()];
    let requested = match scopes {
        Ok(value) if !value.trim().is_empty() => value,
        _ => "profile,email".to_string(),
    };
    for scope in requested.split(',').map(str::trim) {
        if !scope.is_empty() && !result.iter().any(|existing| existing == scope) {
            result.push(scope.to_string());
        }
    }
    result
}
