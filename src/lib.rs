#![allow(rustdoc::invalid_rust_codeblocks)]
#![doc = r#"
# actix-bff-gateway

A Backend For Frontend (BFF) gateway for the [Actix web framework](https://actix.rs), sitting between a browser frontend and a resource API.

The gateway runs the OIDC authorization-code flow with PKCE server-side, keeps the resulting tokens in a server-side session and hands the browser nothing but an opaque `BFFSESSIONID` cookie. Every frontend API call under `/api` is forwarded to the resource server with the session's access token attached as a bearer credential.

Login is powered by the [openidconnect](https://docs.rs/openidconnect) crate.

# Getting started

```rust,ignore
use actix_bff_gateway::{app::Gateway, config::GatewayConfig};
use actix_web::HttpServer;
use dotenv::dotenv;
use env_logger::Env;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();

    env_logger::init_from_env(Env::default().default_filter_or("info"));

    // Read configuration from the environment
    let config = GatewayConfig::from_env()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;

    // Connect stores, discover the identity provider and resolve logout metadata
    let gateway = Gateway::setup(config).await?;
    let bind_address = gateway.bind_address().to_string();

    HttpServer::new(move || gateway.app())
        .bind(bind_address)?
        .run()
        .await
}
```

## Endpoints

| Method | Path | |
|---|---|---|
| GET | `/health` | liveness |
| GET | `/bff/auth/login?continue=..` | starts a login, or returns to the frontend when already logged in |
| GET | `/bff/auth/user` | profile of the logged in user |
| POST | `/bff/auth/logout?complete=true` | ends the session, `complete` also ends the identity provider session |
| GET | `/oauth2/authorization/idp` | redirect to the identity provider |
| GET | `/bff/login/oauth2/code/idp` | identity provider callback |
| ANY | `/api/**` | forwarded to the resource server |

## Request pipeline

Requests pass the stages of [`app::PIPELINE`] in order:

- [`error::ErrorUnifier`] turns every failure into one JSON shape, `{error, message, status, path, timestamp}`.
- [`middleware::RateLimitGate`] consults a token bucket per route class and caller, answering `429` when it is empty.
- [`middleware::AuthenticationResolver`] loads the session behind the session cookie.
- Route dispatch, see the table above.

Buckets and sessions live in Redis when `REDIS_URL` is set, so several gateway instances share them. Without it both are kept in process.

## Using the session in your own handlers

The [`session::Authentication`] extractor fails with `401` when no session is bound to the request.

```rust,ignore
#[get("/whoami")]
async fn whoami(authentication: Authentication) -> impl Responder {
    HttpResponse::Ok().body(authentication.session.principal_id.clone())
}
```
"#]

pub mod app;
pub mod config;
pub(crate) mod cookie;
pub(crate) mod env_var;
pub mod error;
pub mod logout;
pub mod metadata;
pub mod middleware;
pub mod oidc;
pub mod proxy;
pub mod rate_limit;
pub(crate) mod route;
pub mod session;
pub mod store;
pub(crate) mod types;

const COOKIE_AUTH_CHALLENGE_STATE_PREFIX: &str = "oidc_challenge_";
pub(crate) const SESSION_COOKIE: &str = "BFFSESSIONID";
const CSRF_COOKIE: &str = "XSRF-TOKEN";
