use crate::{
    cookie::CookieHelper,
    metadata::OidcMetadata,
    session::{current_authentication, session_cookie_id, ResolvedSession},
    store::SessionStore,
};
use actix_web::{HttpMessage, HttpRequest, HttpResponseBuilder};
use oauth2::url::Url;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogoutCompleteness {
    /// Only the gateway session ends.
    Local,
    /// The identity provider session is ended too.
    Full,
}

impl From<bool> for LogoutCompleteness {
    fn from(complete: bool) -> Self {
        if complete {
            LogoutCompleteness::Full
        } else {
            LogoutCompleteness::Local
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LogoutResult {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl LogoutResult {
    const SUCCESS: &'static str = "success";
    const REMOTE_FAILED: &'static str = "Identity provider logout failed, local logout completed";

    fn success() -> Self {
        Self {
            message: Self::SUCCESS.to_string(),
            warning: None,
        }
    }

    fn remote_failed() -> Self {
        Self {
            message: Self::SUCCESS.to_string(),
            warning: Some(Self::REMOTE_FAILED.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum RemoteLogoutError {
    #[error("end_session_endpoint is unknown")]
    EndpointUnavailable,
    #[error("identity provider answered with status {0}")]
    Status(u16),
    #[error("identity provider request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Ends sessions locally and, on request, at the identity provider.
pub struct SessionTerminator {
    http: reqwest::Client,
    sessions: Arc<dyn SessionStore>,
    metadata: OidcMetadata,
    post_logout_redirect_uri: String,
    timeout: Duration,
}

impl SessionTerminator {
    pub fn new(
        http: reqwest::Client,
        sessions: Arc<dyn SessionStore>,
        metadata: OidcMetadata,
        post_logout_redirect_uri: String,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            sessions,
            metadata,
            post_logout_redirect_uri,
            timeout,
        }
    }

    /// Local logout always completes. Identity provider failures only add a warning.
    pub async fn logout(
        &self,
        req: &HttpRequest,
        response: &mut HttpResponseBuilder,
        completeness: LogoutCompleteness,
    ) -> LogoutResult {
        let authentication = current_authentication(req);
        let id_token = authentication
            .as_ref()
            .and_then(|authentication| authentication.session.id_token.clone());

        let session_id = authentication
            .map(|authentication| authentication.session_id)
            .or_else(|| session_cookie_id(req));
        if let Some(session_id) = session_id {
            match self.sessions.invalidate(&session_id).await {
                Ok(()) => log::info!("Session invalidated."),
                Err(err) => log::error!("Failed to invalidate session, continuing logout: {}", err),
            }
        }
        req.extensions_mut().insert(ResolvedSession(None));
        CookieHelper::clear_authentication_cookies(response);

        if completeness == LogoutCompleteness::Local {
            return LogoutResult::success();
        }
        let Some(id_token) = id_token else {
            log::debug!("No ID token in session, skipping identity provider logout.");
            return LogoutResult::success();
        };

        match self.remote_logout(&id_token).await {
            Ok(()) => {
                log::info!("Identity provider logout completed.");
                LogoutResult::success()
            }
            Err(err) => {
                log::warn!("Identity provider logout failed: {}", err);
                LogoutResult::remote_failed()
            }
        }
    }

    pub(crate) fn end_session_url(&self, id_token: &str) -> Result<Url, RemoteLogoutError> {
        let mut url = self
            .metadata
            .end_session_endpoint()
            .cloned()
            .ok_or(RemoteLogoutError::EndpointUnavailable)?;
        url.query_pairs_mut()
            .append_pair("id_token_hint", id_token)
            .append_pair("post_logout_redirect_uri", &self.post_logout_redirect_uri);
        Ok(url)
    }

    async fn remote_logout(&self, id_token: &str) -> Result<(), RemoteLogoutError> {
        let url = self.end_session_url(id_token)?;
        let status = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?
            .status();

        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(RemoteLogoutError::Status(status.as_u16()))
        }
    }
}
