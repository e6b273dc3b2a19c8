use crate::{config::OidcSettings, session::AuthenticatedSession};
use async_trait::async_trait;
use chrono::Utc;
use oauth2::{
    url::Url, AuthorizationCode, ClientId, ClientSecret, CsrfToken, ErrorResponse,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RequestTokenError, Scope,
};
use openidconnect::{
    core::{CoreAuthenticationFlow, CoreClient, CoreProviderMetadata},
    reqwest::async_http_client,
    AccessTokenHash, IssuerUrl, Nonce, OAuth2TokenResponse, TokenResponse,
};
use std::time::Duration;

/// Login side of the relying party: builds authorization requests and redeems codes.
#[async_trait]
pub trait OidcBffClientTrait: Send + Sync {
    fn generate_challenge_response(&self, challenge: PkceCodeChallenge) -> (Url, CsrfToken, Nonce);

    /// Redeems `code`, verifies the ID token against `nonce` and returns the new session.
    async fn exchange_code(
        &self,
        code: String,
        pkce_verifier: String,
        nonce: Nonce,
    ) -> Result<AuthenticatedSession, OidcError>;
}

pub struct OidcBffClient {
    client: CoreClient,
    scopes: Vec<Scope>,
    timeout: Duration,
}

impl OidcBffClient {
    pub async fn new(settings: &OidcSettings, timeout: Duration) -> Result<Self, OidcError> {
        let issuer = IssuerUrl::new(settings.issuer_url.clone())
            .map_err(|err| OidcError::Configuration(err.to_string()))?;

        let provider_metadata = tokio::time::timeout(
            timeout,
            CoreProviderMetadata::discover_async(issuer, async_http_client),
        )
        .await
        .map_err(|_| OidcError::Discovery(format!("timed out after {:?}", timeout)))?
        .map_err(|err| OidcError::Discovery(err.to_string()))?;

        let redirect_url = RedirectUrl::new(settings.redirect_uri.clone())
            .map_err(|err| OidcError::Configuration(err.to_string()))?;

        let client = CoreClient::from_provider_metadata(
            provider_metadata,
            ClientId::new(settings.client_id.clone()),
            settings.client_secret.clone().map(ClientSecret::new),
        )
        .set_redirect_uri(redirect_url);

        log::info!("OIDC client configured for issuer {}.", settings.issuer_url);

        Ok(Self {
            client,
            // The authorization request always carries `openid` itself.
            scopes: settings
                .scopes
                .iter()
                .filter(|scope| scope.as_str() != "openid")
                .cloned()
                .map(Scope::new)
                .collect(),
            timeout,
        })
    }
}

#[async_trait]
impl OidcBffClientTrait for OidcBffClient {
    fn generate_challenge_response(&self, challenge: PkceCodeChallenge) -> (Url, CsrfToken, Nonce) {
        self.client
            .authorize_url(
                CoreAuthenticationFlow::AuthorizationCode,
                CsrfToken::new_random,
                Nonce::new_random,
            )
            .add_scopes(self.scopes.clone())
            .set_pkce_challenge(challenge)
            .url()
    }

    async fn exchange_code(
        &self,
        code: String,
        pkce_verifier: String,
        nonce: Nonce,
    ) -> Result<AuthenticatedSession, OidcError> {
        let token_response = tokio::time::timeout(
            self.timeout,
            self.client
                .exchange_code(AuthorizationCode::new(code))
                .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier))
                .request_async(async_http_client),
        )
        .await
        .map_err(|_| {
            OidcError::TokenEndpointUnreachable(format!("timed out after {:?}", self.timeout))
        })?
        .map_err(OidcError::from_token_error)?;

        let id_token = token_response
            .id_token()
            .ok_or(OidcError::MissingIdToken)?;
        let claims = id_token
            .claims(&self.client.id_token_verifier(), &nonce)
            .map_err(|err| OidcError::ClaimsVerification(err.to_string()))?;

        match claims.access_token_hash() {
            Some(expected_access_token_hash) => {
                let signing_alg = id_token
                    .signing_alg()
                    .map_err(|err| OidcError::ClaimsVerification(err.to_string()))?;
                let actual_access_token_hash =
                    AccessTokenHash::from_token(token_response.access_token(), &signing_alg)
                        .map_err(|err| OidcError::ClaimsVerification(err.to_string()))?;
                if actual_access_token_hash != *expected_access_token_hash {
                    return Err(OidcError::InvalidAccessToken);
                }
            }
            None => log::debug!("ID token carries no at_hash, skipping access token binding."),
        }

        Ok(AuthenticatedSession {
            principal_id: claims.subject().as_str().to_string(),
            access_token: Some(token_response.access_token().secret().to_owned()),
            refresh_token: token_response
                .refresh_token()
                .map(|token| token.secret().to_owned()),
            id_token: Some(id_token.to_string()),
            name: claims
                .name()
                .and_then(|name| name.get(None))
                .map(|name| name.as_str().to_string()),
            email: claims.email().map(|email| email.as_str().to_string()),
            preferred_username: claims
                .preferred_username()
                .map(|username| username.as_str().to_string()),
            created: Utc::now(),
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum OidcError {
    #[error("OIDC discovery failed: {0}")]
    Discovery(String),
    #[error("Invalid OIDC configuration: {0}")]
    Configuration(String),
    #[error("Token endpoint rejected the code exchange: {0}")]
    TokenRejected(String),
    #[error("Token endpoint returned an invalid response: {0}")]
    TokenResponseInvalid(String),
    #[error("Token endpoint unreachable: {0}")]
    TokenEndpointUnreachable(String),
    #[error("Server did not return an ID token")]
    MissingIdToken,
    #[error("ID token verification failed: {0}")]
    ClaimsVerification(String),
    #[error("Access token does not match the ID token hash")]
    InvalidAccessToken,
}

impl OidcError {
    fn from_token_error<RE, T>(err: RequestTokenError<RE, T>) -> Self
    where
        RE: std::error::Error + 'static,
        T: ErrorResponse + std::fmt::Display + 'static,
    {
        match err {
            RequestTokenError::ServerResponse(response) => Self::TokenRejected(response.to_string()),
            RequestTokenError::Request(err) => Self::TokenEndpointUnreachable(err.to_string()),
            RequestTokenError::Parse(err, _) => Self::TokenResponseInvalid(err.to_string()),
            RequestTokenError::Other(message) => Self::TokenResponseInvalid(message),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use mockall::mock;
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    mock! {
        pub OidcBffClientStruct {}

        #[async_trait]
        impl OidcBffClientTrait for OidcBffClientStruct {
            fn generate_challenge_response(&self, challenge: PkceCodeChallenge) -> (Url, CsrfToken, Nonce);
            async fn exchange_code(
                &self,
                code: String,
                pkce_verifier: String,
                nonce: Nonce,
            ) -> Result<AuthenticatedSession, OidcError>;
        }
    }

    async fn identity_provider() -> MockServer {
        let server = MockServer::start().await;
        let issuer = server.uri();
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": issuer,
                "authorization_endpoint": format!("{}/authorize", issuer),
                "token_endpoint": format!("{}/token", issuer),
                "jwks_uri": format!("{}/jwks", issuer),
                "end_session_endpoint": format!("{}/logout", issuer),
                "response_types_supported": ["code"],
                "subject_types_supported": ["public"],
                "id_token_signing_alg_values_supported": ["RS256"],
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": [] })))
            .mount(&server)
            .await;
        server
    }

    fn settings(issuer_url: String) -> OidcSettings {
        OidcSettings {
            issuer_url,
            client_id: "bff".to_string(),
            client_secret: Some("secret".to_string()),
            redirect_uri: "http://localhost:8888/bff/login/oauth2/code/idp".to_string(),
            post_logout_redirect_uri: "http://localhost:5173/logout-complete".to_string(),
            scopes: vec!["openid".to_string(), "profile".to_string()],
        }
    }

    #[actix_web::test]
    async fn given_discovery_when_generate_challenge_then_authorization_url_has_pkce_and_scopes() {
        // Arrange
        let server = identity_provider().await;
        let client = OidcBffClient::new(&settings(server.uri()), Duration::from_secs(5))
            .await
            .unwrap();
        let (challenge, _) = PkceCodeChallenge::new_random_sha256();
        let expected_challenge = challenge.as_str().to_string();

        // Act
        let (url, csrf_token, nonce) = client.generate_challenge_response(challenge);

        // Assert
        assert_eq!(url.path(), "/authorize");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let value = |key: &str| {
            pairs
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.clone())
        };
        assert_eq!(value("client_id").as_deref(), Some("bff"));
        assert_eq!(value("code_challenge").as_deref(), Some(expected_challenge.as_str()));
        assert_eq!(value("code_challenge_method").as_deref(), Some("S256"));
        assert_eq!(value("state").as_deref(), Some(csrf_token.secret().as_str()));
        assert_eq!(value("nonce").as_deref(), Some(nonce.secret().as_str()));
        assert_eq!(value("scope").as_deref(), Some("openid profile"));
    }

    #[actix_web::test]
    async fn given_rejected_code_when_exchange_then_token_rejected() {
        // Arrange
        let server = identity_provider().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant" })),
            )
            .mount(&server)
            .await;
        let client = OidcBffClient::new(&settings(server.uri()), Duration::from_secs(5))
            .await
            .unwrap();

        // Act
        let result = client
            .exchange_code("code".into(), "verifier".into(), Nonce::new("n".into()))
            .await;

        // Assert
        assert!(matches!(result, Err(OidcError::TokenRejected(_))));
    }

    #[actix_web::test]
    async fn given_garbage_token_response_when_exchange_then_invalid_response() {
        let server = identity_provider().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_string("{\"not\":\"a token\"}"),
            )
            .mount(&server)
            .await;
        let client = OidcBffClient::new(&settings(server.uri()), Duration::from_secs(5))
            .await
            .unwrap();

        let result = client
            .exchange_code("code".into(), "verifier".into(), Nonce::new("n".into()))
            .await;

        assert!(matches!(result, Err(OidcError::TokenResponseInvalid(_))));
    }

    #[actix_web::test]
    async fn given_unreachable_issuer_when_new_then_discovery_error() {
        let result =
            OidcBffClient::new(&settings("http://127.0.0.1:1".to_string()), Duration::from_secs(2))
                .await;

        assert!(matches!(result, Err(OidcError::Discovery(_))));
    }
}
