use anyhow::Result;
use env_logger::Env;
use log::warn;

use gatekeeper::api;
use gatekeeper::config::InviteConfig;

#[actix_web::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = InviteConfig::from_env()?;
    if config.channels.is_empty() {
        warn!("No channels configured; every request will be rejected as InvalidChannel");
    }
    if config.allow_unauthenticated {
        warn!("ALLOW_UNAUTHENTICATED_DB is set; database calls may go out without credentials");
    }

    api::run_api_server(config).await
}
