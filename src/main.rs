mod app;
mod config;
mod error;
mod escalation;
mod generator;
mod intent;
mod keyed_lock;
mod knowledge;
mod memory;
mod personalization;
mod pg_store;
mod pipeline;
mod prompting;
mod session;
mod store;
mod transport;
mod types;
mod webhook;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "clinic_gateway=info,tower_http=info".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = config::GatewayConfig::from_env();
    if let Err(err) = app::run(config).await {
        tracing::error!(error = %err, "gateway stopped");
        std::process::exit(1);
    }
}
