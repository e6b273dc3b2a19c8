use actix_web::{
    cookie::Expiration, error::ErrorNotFound, get, http::header, post, web, HttpRequest,
    HttpResponse, Responder,
};
use oauth2::url::{ParseError, Url};
use openidconnect::{Nonce, PkceCodeChallenge};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

use crate::{
    config::GatewayConfig,
    cookie::{CookieChunker, CookieCrypto, CookieHelper, CookiePath},
    error::GatewayError,
    logout::SessionTerminator,
    oidc::OidcBffClientTrait,
    proxy::{ProxyRequest, ReverseProxy},
    session::{generate_session_id, session_cookie_id, Authentication},
    store::SessionStore,
    types::{
        AuthCallbackParams, AuthLoginParams, ChallengeState, HealthResponse, LogoutParams,
        UserResponse,
    },
    COOKIE_AUTH_CHALLENGE_STATE_PREFIX,
};

pub(crate) const HEALTH_PATH: &str = "/health";
pub(crate) const AUTH_SCOPE: &str = "/bff/auth";
pub(crate) const AUTH_LOGOUT_PATH: &str = "/bff/auth/logout";
pub(crate) const AUTHORIZATION_SCOPE: &str = "/oauth2/authorization";
pub(crate) const AUTHORIZATION_PREFIX: &str = "/oauth2/authorization/";
pub(crate) const AUTHORIZATION_PATH: &str = "/oauth2/authorization/idp";
pub(crate) const CALLBACK_SCOPE: &str = "/bff/login/oauth2/code";
pub(crate) const CALLBACK_PREFIX: &str = "/bff/login/oauth2/code/";
pub(crate) const CALLBACK_PATH: &str = "/bff/login/oauth2/code/idp";
pub(crate) const API_SCOPE: &str = "/api";

const FRONTEND_CALLBACK: &str = "auth-callback";
const LOCALHOST: &str = "localhost";

#[get("/health")]
pub(crate) async fn health() -> impl Responder {
    web::Json(HealthResponse::up())
}

#[get("/login")]
pub(crate) async fn login_start(
    params: web::Query<AuthLoginParams>,
    authentication: Option<Authentication>,
    config: web::Data<GatewayConfig>,
) -> impl Responder {
    let location = match (authentication, &params.continue_path) {
        (Some(_), _) => redirect_target(&config.frontend_url, params.continue_path.as_deref()),
        (None, Some(continue_path)) => format!(
            "{}?continue={}",
            AUTHORIZATION_PATH,
            utf8_percent_encode(continue_path, NON_ALPHANUMERIC)
        ),
        (None, None) => AUTHORIZATION_PATH.to_string(),
    };

    HttpResponse::TemporaryRedirect()
        .append_header((header::LOCATION, location))
        .finish()
}

#[get("/idp")]
pub(crate) async fn authorization(
    req: HttpRequest,
    params: web::Query<AuthLoginParams>,
    client: web::Data<dyn OidcBffClientTrait>,
    config: web::Data<GatewayConfig>,
    crypto: web::Data<CookieCrypto>,
) -> Result<HttpResponse, GatewayError> {
    let path = redirect_target(&config.frontend_url, params.continue_path.as_deref());

    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
    let (auth_url, csrf_token, nonce) = client.generate_challenge_response(pkce_challenge);

    let challenge_state = ChallengeState::new(pkce_verifier, csrf_token, nonce, path);
    let challenge_state_serialized = serde_json::to_string(&challenge_state)
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
    let chunker = CookieChunker::encrypt(
        &crypto,
        &challenge_state_serialized,
        COOKIE_AUTH_CHALLENGE_STATE_PREFIX,
        Expiration::Session,
        CookiePath::Callback,
    )
    .map_err(|err| GatewayError::Internal(err.to_string()))?;

    let mut response = HttpResponse::TemporaryRedirect();
    CookieHelper::replace_challenge_cookies(&req, &mut response, chunker);

    Ok(response
        .append_header((header::LOCATION, auth_url.to_string()))
        .finish())
}

#[get("/idp")]
pub(crate) async fn auth_callback(
    req: HttpRequest,
    params: web::Query<AuthCallbackParams>,
    client: web::Data<dyn OidcBffClientTrait>,
    sessions: web::Data<dyn SessionStore>,
    crypto: web::Data<CookieCrypto>,
) -> Result<HttpResponse, GatewayError> {
    if let Some(error) = &params.error {
        log::warn!(
            "Identity provider returned {}: {}",
            error,
            params.error_description.as_deref().unwrap_or_default()
        );
        return Err(GatewayError::Unauthenticated(
            "Login was not completed.".to_string(),
        ));
    }
    let (Some(code), Some(state)) = (&params.code, &params.state) else {
        return Err(GatewayError::Unauthenticated(
            "Authorization response is incomplete.".to_string(),
        ));
    };

    let challenge_state = read_challenge_state(&req, &crypto)?;
    if challenge_state.csrf_token != *state {
        return Err(GatewayError::Unauthenticated(
            "CSRF token doesn't match.".to_string(),
        ));
    }

    let session = client
        .exchange_code(
            code.to_owned(),
            challenge_state.pkce_verifier,
            Nonce::new(challenge_state.nonce),
        )
        .await?;

    if let Some(previous) = session_cookie_id(&req) {
        sessions.invalidate(&previous).await?;
    }
    let session_id = generate_session_id();
    sessions.save(&session_id, &session).await?;
    log::info!("Session created for {}.", session.principal_id);

    let mut response = HttpResponse::TemporaryRedirect();
    response.cookie(CookieHelper::session_cookie(&session_id));
    CookieHelper::remove_challenge_cookies(&req, &mut response);

    Ok(response
        .append_header((header::LOCATION, challenge_state.path))
        .finish())
}

#[get("/user")]
pub(crate) async fn user(authentication: Authentication) -> impl Responder {
    web::Json(UserResponse::from(authentication.session.as_ref()))
}

#[post("/logout")]
pub(crate) async fn logout(
    req: HttpRequest,
    params: web::Query<LogoutParams>,
    terminator: web::Data<SessionTerminator>,
) -> impl Responder {
    let mut response = HttpResponse::Ok();
    let result = terminator
        .logout(&req, &mut response, params.complete.into())
        .await;
    response.json(result)
}

pub(crate) async fn api_proxy(
    req: HttpRequest,
    body: web::Bytes,
    proxy: web::Data<ReverseProxy>,
    authentication: Option<Authentication>,
) -> Result<HttpResponse, GatewayError> {
    let request = ProxyRequest::from_http_request(&req, body, authentication.as_ref());
    let response = proxy.forward(request).await?;
    Ok(response.into_http_response())
}

pub(crate) async fn not_found() -> actix_web::Result<HttpResponse> {
    Err(ErrorNotFound("No route matches the request."))
}

/// Registers every gateway endpoint on an application or scope.
pub fn gateway_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(
            web::scope(AUTH_SCOPE)
                .service(login_start)
                .service(user)
                .service(logout),
        )
        .service(web::scope(AUTHORIZATION_SCOPE).service(authorization))
        .service(web::scope(CALLBACK_SCOPE).service(auth_callback))
        .service(web::scope(API_SCOPE).default_service(web::to(api_proxy)));
}

fn read_challenge_state(
    req: &HttpRequest,
    crypto: &CookieCrypto,
) -> Result<ChallengeState, GatewayError> {
    let unauthenticated = |reason: String| {
        log::warn!("Unusable challenge state: {}", reason);
        GatewayError::Unauthenticated("Login state is missing or invalid.".to_string())
    };

    let cookies = req
        .cookies()
        .map_err(|err| unauthenticated(err.to_string()))?
        .to_vec();
    let chunker = CookieChunker::from_cookies(&cookies, COOKIE_AUTH_CHALLENGE_STATE_PREFIX)
        .map_err(|err| unauthenticated(err.to_string()))?;
    let serialized = chunker
        .decrypt(crypto)
        .map_err(|err| unauthenticated(err.to_string()))?;
    serde_json::from_str(&serialized).map_err(|err| unauthenticated(err.to_string()))
}

/// Validated `continue` target, or the frontend's callback page.
fn redirect_target(frontend_url: &Url, continue_path: Option<&str>) -> String {
    match continue_path {
        Some(candidate) if !candidate.trim().is_empty() && is_url_safe(frontend_url, candidate) => {
            candidate.to_string()
        }
        Some(candidate) => {
            log::warn!("Ignoring unsafe continue target {}.", candidate);
            frontend_callback(frontend_url)
        }
        None => frontend_callback(frontend_url),
    }
}

fn frontend_callback(frontend_url: &Url) -> String {
    format!(
        "{}/{}",
        frontend_url.as_str().trim_end_matches('/'),
        FRONTEND_CALLBACK
    )
}

/// Relative paths, or absolute http(s) URLs pointing at localhost or the frontend host.
pub(crate) fn is_url_safe(frontend_url: &Url, candidate: &str) -> bool {
    match Url::parse(candidate) {
        Ok(url) => {
            matches!(url.scheme(), "http" | "https")
                && url
                    .host_str()
                    .is_some_and(|host| host == LOCALHOST || Some(host) == frontend_url.host_str())
        }
        Err(ParseError::RelativeUrlWithoutBase) => {
            candidate.starts_with('/') && !candidate.starts_with("//") && !candidate.contains('\\')
        }
        Err(_) => false,
    }
}
