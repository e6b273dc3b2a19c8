use crate::{
    config::RateLimitSettings,
    error::GatewayError,
    rate_limit::{classify, in_namespace, IdentitySource, TokenBucketLimiter},
    route::API_SCOPE,
    session::{resolve_session, ResolvedSession},
    store::SessionStore,
};
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web::Data,
    Error, HttpMessage, HttpRequest,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    rc::Rc,
};

const UNKNOWN_CLIENT: &str = "unknown";

/// Client address as seen through trusted forwarding headers, `unknown` when absent.
pub(crate) fn client_ip(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

fn registered<T: ?Sized + 'static>(req: &ServiceRequest, name: &str) -> Result<Data<T>, Error> {
    req.app_data::<Data<T>>().cloned().ok_or_else(|| {
        GatewayError::Internal(format!("{} is not registered as app data.", name)).into()
    })
}

/// Admits or rejects a request against its token bucket before anything else
/// touches it. Requires [`RateLimitSettings`], [`TokenBucketLimiter`] and the
/// [`SessionStore`] as app data.
#[derive(Default)]
pub struct RateLimitGate;

impl<S, B> Transform<S, ServiceRequest> for RateLimitGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = RateLimitGateMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitGateMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct RateLimitGateMiddleware<S> {
    service: Rc<S>,
}

impl<S> RateLimitGateMiddleware<S> {
    async fn admit(req: &ServiceRequest, settings: &RateLimitSettings) -> Result<(), Error> {
        let limiter = registered::<TokenBucketLimiter>(req, "TokenBucketLimiter")?;
        let path = req.path();

        // Only API traffic is keyed by session, other classes never need the lookup.
        let session_id = if in_namespace(path, API_SCOPE) {
            let sessions = registered::<dyn SessionStore>(req, "SessionStore")?;
            resolve_session(req.request(), sessions.get_ref())
                .await
                .map_err(GatewayError::from)?
                .map(|authentication| authentication.session_id)
        } else {
            None
        };
        let identity = IdentitySource {
            client_ip: client_ip(req.request()),
            session_id,
        };

        let Some(key) = classify(path, &identity) else {
            return Ok(());
        };
        let policy = settings.policies.for_class(key.route_class());
        let allowed = limiter
            .try_consume(&key, &policy)
            .await
            .map_err(GatewayError::from)?;
        if !allowed {
            log::warn!(
                "Rate limit exceeded: class={}, path={}.",
                key.route_class(),
                path
            );
            return Err(GatewayError::RateLimitExceeded.into());
        }
        Ok(())
    }
}

impl<S, B> Service<ServiceRequest> for RateLimitGateMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);

        let settings = match registered::<RateLimitSettings>(&req, "RateLimitSettings") {
            Ok(settings) => settings,
            Err(err) => return Box::pin(ready(Ok(req.error_response(err).map_into_right_body()))),
        };

        Box::pin(async move {
            if settings.enabled {
                if let Err(err) = Self::admit(&req, &settings).await {
                    return Ok(req.error_response(err).map_into_right_body());
                }
            }

            let res = service.call(req).await?;
            Ok(res.map_into_left_body())
        })
    }
}

/// Binds the session referenced by the session cookie to the request, so handlers
/// can use the [`Authentication`](crate::session::Authentication) extractor.
///
/// When the session store fails, API requests are answered with an error while every
/// other request continues anonymously, so logout and health keep working.
#[derive(Default)]
pub struct AuthenticationResolver;

impl<S, B> Transform<S, ServiceRequest> for AuthenticationResolver
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthenticationResolverMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthenticationResolverMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct AuthenticationResolverMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for AuthenticationResolverMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);

        let sessions = match registered::<dyn SessionStore>(&req, "SessionStore") {
            Ok(sessions) => sessions,
            Err(err) => return Box::pin(ready(Ok(req.error_response(err).map_into_right_body()))),
        };

        Box::pin(async move {
            if let Err(err) = resolve_session(req.request(), sessions.get_ref()).await {
                if in_namespace(req.path(), API_SCOPE) {
                    return Ok(req
                        .error_response(GatewayError::from(err))
                        .map_into_right_body());
                }
                log::error!(
                    "Session lookup failed, continuing anonymously for {}: {}",
                    req.path(),
                    err
                );
                req.extensions_mut().insert(ResolvedSession(None));
            }

            let res = service.call(req).await?;
            Ok(res.map_into_left_body())
        })
    }
}
