use crate::{oidc::OidcError, store::StoreError};
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    error::InternalError,
    http::StatusCode,
    Error, HttpResponse, ResponseError,
};
use chrono::{DateTime, Utc};
use futures_util::future::LocalBoxFuture;
use serde::Serialize;
use std::future::{ready, Ready};

/// Failures every gateway component reports, each maps to one HTTP status and code.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("Too many requests. Please wait a moment and try again.")]
    RateLimitExceeded,
    #[error("{0}")]
    Unauthenticated(String),
    #[error("Upstream responded with status {status}")]
    UpstreamStatus { status: u16 },
    #[error("Upstream unreachable: {0}")]
    UpstreamConnection(String),
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::RateLimitExceeded => "TOO_MANY_REQUESTS",
            GatewayError::Unauthenticated(_) => "UNAUTHORIZED",
            GatewayError::UpstreamStatus { status } if (400..500).contains(status) => {
                "UPSTREAM_CLIENT_ERROR"
            }
            GatewayError::UpstreamStatus { status } if (500..600).contains(status) => {
                "UPSTREAM_SERVER_ERROR"
            }
            GatewayError::UpstreamConnection(_) => "UPSTREAM_CONNECTION_ERROR",
            GatewayError::UpstreamStatus { .. } | GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Client facing message, never carries upstream or internal details.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::RateLimitExceeded | GatewayError::Unauthenticated(_) => self.to_string(),
            GatewayError::UpstreamStatus { .. } => match self.status_code() {
                StatusCode::BAD_REQUEST => "The request was rejected by the upstream service.",
                StatusCode::SERVICE_UNAVAILABLE => {
                    "The upstream service is unavailable. Please try again later."
                }
                _ => "An internal server error occurred.",
            }
            .to_string(),
            GatewayError::UpstreamConnection(_) => {
                "Could not connect to the upstream service.".to_string()
            }
            GatewayError::Internal(_) => "An internal server error occurred.".to_string(),
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::UpstreamStatus { status } if (400..500).contains(status) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::UpstreamStatus { status } if (500..600).contains(status) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamConnection(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamStatus { .. } | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        ErrorPayload::from_gateway_error(self, "").into_response()
    }
}

impl From<StoreError> for GatewayError {
    fn from(value: StoreError) -> Self {
        GatewayError::Internal(value.to_string())
    }
}

impl From<OidcError> for GatewayError {
    fn from(value: OidcError) -> Self {
        match value {
            OidcError::TokenRejected(_) => GatewayError::UpstreamStatus { status: 400 },
            OidcError::TokenResponseInvalid(_) => GatewayError::UpstreamStatus { status: 502 },
            OidcError::TokenEndpointUnreachable(err) => GatewayError::UpstreamConnection(err),
            OidcError::MissingIdToken
            | OidcError::ClaimsVerification(_)
            | OidcError::InvalidAccessToken => {
                log::warn!("Rejected login: {}", value);
                GatewayError::Unauthenticated("Login could not be verified.".to_string())
            }
            OidcError::Discovery(_) | OidcError::Configuration(_) => {
                GatewayError::Internal(value.to_string())
            }
        }
    }
}

/// JSON body of every error the gateway answers with.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    #[serde(rename = "error")]
    pub code: String,
    pub message: String,
    #[serde(rename = "status")]
    pub http_status: u16,
    pub path: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorPayload {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
        path: &str,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            http_status: status.as_u16(),
            path: path.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_gateway_error(err: &GatewayError, path: &str) -> Self {
        Self::new(err.code(), err.public_message(), err.status_code(), path)
    }

    /// Maps any actix error, framework 4xx errors keep their status as `HTTP_{status}`.
    pub fn from_error(err: &Error, path: &str) -> Self {
        if let Some(gateway_error) = err.as_error::<GatewayError>() {
            return Self::from_gateway_error(gateway_error, path);
        }

        let status = err.as_response_error().status_code();
        if status.is_client_error() {
            Self::new(
                format!("HTTP_{}", status.as_u16()),
                client_error_message(status),
                status,
                path,
            )
        } else {
            Self::new(
                "INTERNAL_ERROR",
                "An internal server error occurred.",
                StatusCode::INTERNAL_SERVER_ERROR,
                path,
            )
        }
    }

    pub fn into_response(self) -> HttpResponse {
        let status =
            StatusCode::from_u16(self.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        HttpResponse::build(status).json(self)
    }
}

fn client_error_message(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "Bad request.",
        StatusCode::UNAUTHORIZED => "Authentication is required.",
        StatusCode::FORBIDDEN => "Access denied.",
        StatusCode::NOT_FOUND => "Resource not found.",
        StatusCode::METHOD_NOT_ALLOWED => "Method not allowed.",
        StatusCode::PAYLOAD_TOO_LARGE => "Payload too large.",
        StatusCode::TOO_MANY_REQUESTS => "Too many requests.",
        _ => "The request could not be processed.",
    }
}

/// `None` for failures that are already logged where they happen.
fn failure_level(err: &Error) -> Option<log::Level> {
    match err.as_error::<GatewayError>() {
        // Denials are logged by the gate with their route class.
        Some(GatewayError::RateLimitExceeded) => None,
        Some(GatewayError::Unauthenticated(_)) => Some(log::Level::Warn),
        Some(
            GatewayError::UpstreamStatus { .. }
            | GatewayError::UpstreamConnection(_)
            | GatewayError::Internal(_),
        ) => Some(log::Level::Error),
        None if err.as_response_error().status_code().is_client_error() => Some(log::Level::Debug),
        None => Some(log::Level::Error),
    }
}

fn log_failure(err: &Error, path: &str) {
    if let Some(level) = failure_level(err) {
        let status = err.as_response_error().status_code();
        log::log!(level, "Request to {} failed with {}: {}", path, status, err);
    }
}

/// Outermost stage of the pipeline. Every error response below it, whether rendered
/// by a middleware, a handler or an extractor, leaves the gateway as an [`ErrorPayload`].
#[derive(Default)]
pub struct ErrorUnifier;

impl<S, B> Transform<S, ServiceRequest> for ErrorUnifier
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = ErrorUnifierMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ErrorUnifierMiddleware { service }))
    }
}

pub struct ErrorUnifierMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for ErrorUnifierMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let path = req.path().to_string();
        let fut = self.service.call(req);

        Box::pin(async move {
            let res = match fut.await {
                Ok(res) => res,
                Err(err) => {
                    log_failure(&err, &path);
                    let response = ErrorPayload::from_error(&err, &path).into_response();
                    return Err(InternalError::from_response(err, response).into());
                }
            };

            let payload = res.response().error().map(|err| {
                log_failure(err, &path);
                ErrorPayload::from_error(err, &path)
            });
            match payload {
                Some(payload) => Ok(res.into_response(payload.into_response()).map_into_right_body()),
                None => Ok(res.map_into_left_body()),
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use actix_web::{
        body::to_bytes,
        test::{self as actix_test, TestRequest},
        web, App,
    };
    use serde_json::Value;

    #[test]
    fn test_gateway_error_mapping() {
        let cases = [
            (GatewayError::RateLimitExceeded, 429, "TOO_MANY_REQUESTS"),
            (GatewayError::Unauthenticated("no".into()), 401, "UNAUTHORIZED"),
            (GatewayError::UpstreamStatus { status: 404 }, 400, "UPSTREAM_CLIENT_ERROR"),
            (GatewayError::UpstreamStatus { status: 400 }, 400, "UPSTREAM_CLIENT_ERROR"),
            (GatewayError::UpstreamStatus { status: 502 }, 503, "UPSTREAM_SERVER_ERROR"),
            (GatewayError::UpstreamStatus { status: 302 }, 500, "INTERNAL_ERROR"),
            (GatewayError::UpstreamConnection("refused".into()), 503, "UPSTREAM_CONNECTION_ERROR"),
            (GatewayError::Internal("boom".into()), 500, "INTERNAL_ERROR"),
        ];

        for (err, status, code) in cases {
            assert_eq!(err.status_code().as_u16(), status, "{:?}", err);
            assert_eq!(err.code(), code, "{:?}", err);
        }
    }

    #[test]
    fn test_internal_details_are_not_exposed() {
        let err = GatewayError::Internal("redis at 10.0.0.3 refused".into());

        let payload = ErrorPayload::from_gateway_error(&err, "/api/books");

        assert_eq!(payload.message, "An internal server error occurred.");
        assert_eq!(payload.path, "/api/books");
    }

    #[test]
    fn test_framework_client_error_keeps_status() {
        let err: Error = actix_web::error::ErrorNotFound("missing");

        let payload = ErrorPayload::from_error(&err, "/nothing");

        assert_eq!(payload.code, "HTTP_404");
        assert_eq!(payload.http_status, 404);
    }

    #[test]
    fn test_framework_server_error_is_internal() {
        let err: Error = actix_web::error::ErrorBadGateway("bad");

        let payload = ErrorPayload::from_error(&err, "/x");

        assert_eq!(payload.code, "INTERNAL_ERROR");
        assert_eq!(payload.http_status, 500);
    }

    #[test]
    fn test_oidc_error_mapping() {
        let rejected: GatewayError = OidcError::TokenRejected("invalid_grant".into()).into();
        let invalid: GatewayError = OidcError::TokenResponseInvalid("garbage".into()).into();
        let unreachable: GatewayError = OidcError::TokenEndpointUnreachable("refused".into()).into();
        let unverified: GatewayError = OidcError::InvalidAccessToken.into();

        assert_eq!(rejected.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(invalid.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(unreachable.code(), "UPSTREAM_CONNECTION_ERROR");
        assert_eq!(unverified.status_code(), StatusCode::UNAUTHORIZED);
    }

    async fn failing_handler() -> Result<HttpResponse, GatewayError> {
        Err(GatewayError::UpstreamStatus { status: 503 })
    }

    #[actix_web::test]
    async fn given_handler_error_when_unified_then_payload_has_path() {
        // Arrange
        let app = actix_test::init_service(
            App::new()
                .wrap(ErrorUnifier)
                .route("/api/books", web::get().to(failing_handler)),
        )
        .await;
        let req = TestRequest::get().uri("/api/books?page=1").to_request();

        // Act
        let res = actix_test::call_service(&app, req).await;

        // Assert
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_slice(&to_bytes(res.into_body()).await.unwrap()).unwrap();
        assert_eq!(body["error"], "UPSTREAM_SERVER_ERROR");
        assert_eq!(body["status"], 503);
        assert_eq!(body["path"], "/api/books");
        assert!(body["timestamp"].is_string());
        assert!(body["message"].is_string());
    }

    #[actix_web::test]
    async fn given_unknown_route_when_unified_then_http_404_code() {
        let app = actix_test::init_service(App::new().wrap(ErrorUnifier).default_service(web::to(
            || async { Err::<HttpResponse, _>(actix_web::error::ErrorNotFound("no route")) },
        )))
        .await;
        let req = TestRequest::get().uri("/missing").to_request();

        let res = actix_test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body: Value = serde_json::from_slice(&to_bytes(res.into_body()).await.unwrap()).unwrap();
        assert_eq!(body["error"], "HTTP_404");
    }

    #[actix_web::test]
    async fn given_middleware_error_when_unified_then_payload_has_path() {
        // Arrange
        let app = actix_test::init_service(
            App::new()
                .wrap_fn(|_, _| async {
                    Err::<ServiceResponse, Error>(GatewayError::RateLimitExceeded.into())
                })
                .wrap(ErrorUnifier)
                .route("/bff/auth/login", web::get().to(HttpResponse::Ok)),
        )
        .await;
        let req = TestRequest::get().uri("/bff/auth/login").to_request();

        // Act
        let err = app.call(req).await.err().unwrap();

        // Assert
        let res = err.error_response();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: Value = serde_json::from_slice(&to_bytes(res.into_body()).await.unwrap()).unwrap();
        assert_eq!(body["error"], "TOO_MANY_REQUESTS");
        assert_eq!(body["path"], "/bff/auth/login");
    }

    #[test]
    fn test_rate_limit_denial_is_not_logged_again() {
        let denied: Error = GatewayError::RateLimitExceeded.into();
        let internal: Error = GatewayError::Internal("boom".into()).into();
        let not_found = actix_web::error::ErrorNotFound("no route");

        assert_eq!(failure_level(&denied), None);
        assert_eq!(failure_level(&internal), Some(log::Level::Error));
        assert_eq!(failure_level(&not_found), Some(log::Level::Debug));
    }

    #[actix_web::test]
    async fn given_successful_response_when_unified_then_untouched() {
        let app = actix_test::init_service(
            App::new()
                .wrap(ErrorUnifier)
                .route("/health", web::get().to(|| async { HttpResponse::Ok().body("UP") })),
        )
        .await;
        let req = TestRequest::get().uri("/health").to_request();

        let res = actix_test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(to_bytes(res.into_body()).await.unwrap(), "UP");
    }
}
