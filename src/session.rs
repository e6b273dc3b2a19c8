use crate::{
    error::GatewayError,
    store::{SessionStore, StoreError},
    SESSION_COOKIE,
};
use actix_web::{FromRequest, HttpMessage, HttpRequest};
use aes_gcm::aead::{rand_core::RngCore, OsRng};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    future::{ready, Ready},
    rc::Rc,
};

/// Everything the gateway keeps server-side for a logged in principal.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AuthenticatedSession {
    pub principal_id: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub preferred_username: Option<String>,
    pub created: DateTime<Utc>,
}

impl AuthenticatedSession {
    pub fn new(principal_id: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            access_token: None,
            refresh_token: None,
            id_token: None,
            name: None,
            email: None,
            preferred_username: None,
            created: Utc::now(),
        }
    }
}

/// The session bound to the current request.
///
/// Use it as an extractor in handlers which require a logged in user, extraction
/// fails with [`GatewayError::Unauthenticated`] otherwise.
#[derive(Clone, Debug)]
pub struct Authentication {
    pub session_id: String,
    pub session: Rc<AuthenticatedSession>,
}

impl Authentication {
    pub fn new(session_id: impl Into<String>, session: AuthenticatedSession) -> Self {
        Self {
            session_id: session_id.into(),
            session: Rc::new(session),
        }
    }
}

impl FromRequest for Authentication {
    type Error = GatewayError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut actix_web::dev::Payload) -> Self::Future {
        ready(current_authentication(req).ok_or_else(|| {
            GatewayError::Unauthenticated("Authentication is required.".to_string())
        }))
    }
}

/// Result of looking up the session cookie, cached in the request extensions so
/// the store is queried at most once per request.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedSession(pub(crate) Option<Authentication>);

pub(crate) fn current_authentication(req: &HttpRequest) -> Option<Authentication> {
    req.extensions()
        .get::<ResolvedSession>()
        .and_then(|resolved| resolved.0.clone())
}

pub(crate) fn session_cookie_id(req: &HttpRequest) -> Option<String> {
    req.cookie(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
}

/// Resolves the session referenced by the session cookie, reusing an earlier lookup.
pub(crate) async fn resolve_session(
    req: &HttpRequest,
    sessions: &dyn SessionStore,
) -> Result<Option<Authentication>, StoreError> {
    if let Some(resolved) = req.extensions().get::<ResolvedSession>() {
        return Ok(resolved.0.clone());
    }

    let authentication = match session_cookie_id(req) {
        Some(session_id) => sessions
            .get(&session_id)
            .await?
            .map(|session| Authentication::new(session_id, session)),
        None => None,
    };

    req.extensions_mut()
        .insert(ResolvedSession(authentication.clone()));
    Ok(authentication)
}

/// 32 random bytes, hex encoded.
pub(crate) fn generate_session_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
