use crate::{error::GatewayError, route::API_SCOPE, session::Authentication};
use actix_web::{
    http::{
        header::{HeaderName, HeaderValue, CONTENT_TYPE},
        Method, StatusCode,
    },
    web::Bytes,
    HttpRequest, HttpResponse,
};
use oauth2::url::{form_urlencoded, Url};
use std::time::Duration;

/// Response headers managed by the gateway's own HTTP layer.
pub const EXCLUDED_RESPONSE_HEADERS: [&str; 6] = [
    "transfer-encoding",
    "connection",
    "keep-alive",
    "upgrade",
    "server",
    "content-length",
];

/// An inbound `/api/**` request reduced to what is forwarded.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path below `/api`, as received (percent-encoded).
    pub path: String,
    pub query: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub bearer_token: Option<String>,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn from_http_request(
        req: &HttpRequest,
        body: Bytes,
        authentication: Option<&Authentication>,
    ) -> Self {
        let bearer_token = authentication.and_then(|authentication| {
            let token = authentication.session.access_token.clone();
            if token.is_none() {
                log::warn!(
                    "Session of {} holds no access token, forwarding without credentials.",
                    authentication.session.principal_id
                );
            }
            token
        });

        Self {
            method: req.method().clone(),
            path: req
                .path()
                .strip_prefix(API_SCOPE)
                .unwrap_or_default()
                .to_string(),
            query: form_urlencoded::parse(req.query_string().as_bytes())
                .into_owned()
                .collect(),
            content_type: req
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
            bearer_token,
            body,
        }
    }

    fn carries_body(&self) -> bool {
        !matches!(self.method, Method::GET | Method::DELETE) && !self.body.is_empty()
    }
}

#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn into_http_response(self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status);
        for header in self.headers {
            builder.append_header(header);
        }
        builder.body(self.body)
    }
}

/// Forwards API traffic to the resource server, attaching the session's access token.
pub struct ReverseProxy {
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl ReverseProxy {
    pub fn new(http: reqwest::Client, base_url: Url, timeout: Duration) -> Self {
        Self {
            http,
            base_url,
            timeout,
        }
    }

    pub fn target_url(&self, path: &str, query: &[(String, String)]) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(&format!(
            "{}{}",
            self.base_url.path().trim_end_matches('/'),
            path
        ));
        url.set_query(None);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        url
    }

    pub async fn forward(&self, request: ProxyRequest) -> Result<ProxyResponse, GatewayError> {
        let url = self.target_url(&request.path, &request.query);
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        log::debug!("Proxying {} {}.", request.method, url.path());

        let mut builder = self.http.request(method, url).timeout(self.timeout);
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(content_type) = &request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type.as_str());
        }
        if request.carries_body() {
            builder = builder.body(request.body.to_vec());
        }

        let response = builder.send().await.map_err(|err| {
            log::error!("Resource server request failed: {}", err);
            GatewayError::UpstreamConnection(err.to_string())
        })?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !EXCLUDED_RESPONSE_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                Some((
                    HeaderName::from_bytes(name.as_str().as_bytes()).ok()?,
                    HeaderValue::from_bytes(value.as_bytes()).ok()?,
                ))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| GatewayError::UpstreamConnection(err.to_string()))?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}
