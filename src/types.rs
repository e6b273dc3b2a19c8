use crate::session::AuthenticatedSession;
use oauth2::{CsrfToken, PkceCodeVerifier};
use openidconnect::Nonce;
use serde::{Deserialize, Serialize};

/// Login attempt state carried in the encrypted challenge cookies.
#[derive(Deserialize, Serialize)]
pub(crate) struct ChallengeState {
    pub(crate) pkce_verifier: String,
    pub(crate) csrf_token: String,
    pub(crate) nonce: String,
    /// Where the browser goes after a successful callback.
    pub(crate) path: String,
}

impl ChallengeState {
    pub(crate) fn new(
        pkce_verifier: PkceCodeVerifier,
        csrf_token: CsrfToken,
        nonce: Nonce,
        path: String,
    ) -> Self {
        Self {
            pkce_verifier: pkce_verifier.secret().to_owned(),
            csrf_token: csrf_token.secret().to_owned(),
            nonce: nonce.secret().to_owned(),
            path,
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct AuthCallbackParams {
    pub(crate) code: Option<String>,
    pub(crate) state: Option<String>,
    pub(crate) error: Option<String>,
    pub(crate) error_description: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct AuthLoginParams {
    #[serde(rename = "continue")]
    pub(crate) continue_path: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct LogoutParams {
    #[serde(default)]
    pub(crate) complete: bool,
}

#[derive(Serialize, Debug, PartialEq)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
    pub(crate) service: &'static str,
}

impl HealthResponse {
    pub(crate) fn up() -> Self {
        Self {
            status: "UP",
            service: "auth-bff",
        }
    }
}

#[derive(Serialize, Debug, PartialEq)]
pub(crate) struct UserResponse {
    pub(crate) name: Option<String>,
    pub(crate) email: Option<String>,
    pub(crate) preferred_username: Option<String>,
}

impl From<&AuthenticatedSession> for UserResponse {
    fn from(session: &AuthenticatedSession) -> Self {
        Self {
            name: session.name.clone(),
            email: session.email.clone(),
            preferred_username: session.preferred_username.clone(),
        }
    }
}
