use actix_bff_gateway::{app::Gateway, config::GatewayConfig};
use actix_web::HttpServer;
use dotenv::dotenv;
use env_logger::Env;
use std::io;

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv().ok();

    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let config = GatewayConfig::from_env()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    let gateway = Gateway::setup(config).await?;
    let bind_address = gateway.bind_address().to_string();

    HttpServer::new(move || gateway.app())
        .bind(bind_address)?
        .run()
        .await
}
