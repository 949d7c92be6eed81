use env_logger::Env;

use gatekeeper::relay::{self, RelayConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = RelayConfig::from_env();
    let outcome = relay::run(&config).await;
    // Leave the progress line before the summary.
    println!();
    outcome.report();
}
