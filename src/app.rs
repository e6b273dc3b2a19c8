use crate::{
    config::{GatewayConfig, RateLimitSettings},
    cookie::CookieCrypto,
    error::ErrorUnifier,
    logout::SessionTerminator,
    metadata::OidcMetadata,
    middleware::{AuthenticationResolver, RateLimitGate},
    oidc::{OidcBffClient, OidcBffClientTrait},
    proxy::ReverseProxy,
    rate_limit::TokenBucketLimiter,
    route::{gateway_routes, not_found},
    store::{CounterStore, InMemoryCounterStore, InMemorySessionStore, RedisStore, SessionStore},
};
use actix_web::{
    body::MessageBody,
    dev::{ServiceFactory, ServiceRequest, ServiceResponse},
    web::{self, Data, PayloadConfig},
    App, Error,
};
use std::{io, sync::Arc, time::Duration};

/// Stages every request passes through, outermost first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStage {
    ErrorUnifier,
    RateLimitGate,
    AuthenticationResolver,
    RouteDispatch,
}

pub const PIPELINE: [PipelineStage; 4] = [
    PipelineStage::ErrorUnifier,
    PipelineStage::RateLimitGate,
    PipelineStage::AuthenticationResolver,
    PipelineStage::RouteDispatch,
];

/// Collaborators the gateway is assembled from.
pub struct GatewayParts {
    pub config: GatewayConfig,
    pub counters: Arc<dyn CounterStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub oidc_client: Arc<dyn OidcBffClientTrait>,
    pub metadata: OidcMetadata,
    pub http: reqwest::Client,
}

/// Shared state of a running gateway. Cheap to clone, one clone per worker.
#[derive(Clone)]
pub struct Gateway {
    config: Data<GatewayConfig>,
    rate_limit: Data<RateLimitSettings>,
    limiter: Data<TokenBucketLimiter>,
    sessions: Data<dyn SessionStore>,
    oidc_client: Data<dyn OidcBffClientTrait>,
    proxy: Data<ReverseProxy>,
    terminator: Data<SessionTerminator>,
    crypto: Data<CookieCrypto>,
    payload: PayloadConfig,
}

impl Gateway {
    /// Runs the initialization phase. Failing OIDC discovery for the login client
    /// aborts startup, missing logout metadata only degrades logout.
    pub async fn setup(config: GatewayConfig) -> io::Result<Self> {
        let http = build_http_client(config.idp_timeout).map_err(io::Error::other)?;

        let (counters, sessions): (Arc<dyn CounterStore>, Arc<dyn SessionStore>) =
            match &config.redis_url {
                Some(redis_url) => {
                    let store =
                        RedisStore::connect(redis_url, config.redis_timeout, config.session_lifetime)
                            .await
                            .map_err(io::Error::other)?;
                    (Arc::new(store.clone()), Arc::new(store))
                }
                None => {
                    log::warn!(
                        "No Redis configured, rate limits and sessions are local to this process."
                    );
                    (
                        Arc::new(InMemoryCounterStore::default()),
                        Arc::new(InMemorySessionStore::new(config.session_lifetime)),
                    )
                }
            };

        let oidc_client = OidcBffClient::new(&config.oidc, config.idp_timeout)
            .await
            .map_err(io::Error::other)?;
        let metadata =
            OidcMetadata::resolve(&http, &config.oidc.issuer_url, config.idp_timeout).await;

        log::info!("Gateway initialized, listening on {}.", config.bind_address);
        Ok(Self::from_parts(GatewayParts {
            config,
            counters,
            sessions,
            oidc_client: Arc::new(oidc_client),
            metadata,
            http,
        }))
    }

    pub fn from_parts(parts: GatewayParts) -> Self {
        let GatewayParts {
            config,
            counters,
            sessions,
            oidc_client,
            metadata,
            http,
        } = parts;

        let proxy = ReverseProxy::new(
            http.clone(),
            config.resource_server_url.clone(),
            config.resource_server_timeout,
        );
        let terminator = SessionTerminator::new(
            http,
            Arc::clone(&sessions),
            metadata,
            config.oidc.post_logout_redirect_uri.clone(),
            config.idp_timeout,
        );

        Self {
            rate_limit: Data::new(config.rate_limit.clone()),
            limiter: Data::new(TokenBucketLimiter::new(counters)),
            sessions: Data::from(sessions),
            oidc_client: Data::from(oidc_client),
            proxy: Data::new(proxy),
            terminator: Data::new(terminator),
            crypto: Data::new(CookieCrypto::from_config(config.encryption_key.as_ref())),
            payload: PayloadConfig::new(config.max_body_bytes),
            config: Data::new(config),
        }
    }

    pub fn bind_address(&self) -> &str {
        &self.config.bind_address
    }

    /// The application with every stage of [`PIPELINE`] wrapped in order.
    pub fn app(
        &self,
    ) -> App<
        impl ServiceFactory<
            ServiceRequest,
            Config = (),
            Response = ServiceResponse<impl MessageBody>,
            Error = Error,
            InitError = (),
        >,
    > {
        // The last `wrap` sees the request first.
        App::new()
            .app_data(self.config.clone())
            .app_data(self.rate_limit.clone())
            .app_data(self.limiter.clone())
            .app_data(self.sessions.clone())
            .app_data(self.oidc_client.clone())
            .app_data(self.proxy.clone())
            .app_data(self.terminator.clone())
            .app_data(self.crypto.clone())
            .app_data(self.payload.clone())
            .configure(gateway_routes)
            .default_service(web::to(not_found))
            .wrap(AuthenticationResolver)
            .wrap(RateLimitGate)
            .wrap(ErrorUnifier)
    }
}

/// Outbound client shared by the proxy, discovery and logout. Redirects are
/// relayed to the caller, never followed.
pub fn build_http_client(connect_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(connect_timeout)
        .build()
}
