pub(crate) const AUTHORITY: &str = "AUTHORITY";
pub(crate) const CLIENT_ID: &str = "CLIENT_ID";
pub(crate) const CLIENT_SECRET: &str = "CLIENT_SECRET";
pub(crate) const REDIRECT_URI: &str = "REDIRECT_URI";
pub(crate) const POST_LOGOUT_REDIRECT_URI: &str = "POST_LOGOUT_REDIRECT_URI";

/// Comma seperated list of scopes.
pub(crate) const OIDC_SCOPES: &str = "OIDC_SCOPES";

pub(crate) const FRONTEND_URL: &str = "FRONTEND_URL";
pub(crate) const BFF_BASE_URL: &str = "BFF_BASE_URL";
pub(crate) const BIND_ADDRESS: &str = "BIND_ADDRESS";

pub(crate) const RESOURCE_SERVER_URL: &str = "RESOURCE_SERVER_URL";
pub(crate) const RESOURCE_SERVER_TIMEOUT_SECONDS: &str = "RESOURCE_SERVER_TIMEOUT_SECONDS";
pub(crate) const IDP_TIMEOUT_SECONDS: &str = "IDP_TIMEOUT_SECONDS";
pub(crate) const PROXY_MAX_BODY_BYTES: &str = "PROXY_MAX_BODY_BYTES";

pub(crate) const REDIS_URL: &str = "REDIS_URL";
pub(crate) const REDIS_TIMEOUT_MILLIS: &str = "REDIS_TIMEOUT_MILLIS";
pub(crate) const SESSION_LIFETIME_SECONDS: &str = "SESSION_LIFETIME_SECONDS";

pub(crate) const ENCRYPTION_KEY: &str = "ENCRYPTION_KEY";

pub(crate) const RATE_LIMIT_ENABLED: &str = "RATE_LIMIT_ENABLED";
pub(crate) const RATE_LIMIT_AUTH_RPM: &str = "RATE_LIMIT_AUTH_RPM";
pub(crate) const RATE_LIMIT_API_AUTHENTICATED_RPM: &str = "RATE_LIMIT_API_AUTHENTICATED_RPM";
pub(crate) const RATE_LIMIT_API_ANONYMOUS_RPM: &str = "RATE_LIMIT_API_ANONYMOUS_RPM";
pub(crate) const RATE_LIMIT_REFILL_SECONDS: &str = "RATE_LIMIT_REFILL_SECONDS";
