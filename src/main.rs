use anyhow::Result;
use std::sync::Arc;

use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use tokio::sync::Mutex;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = haas_broker::config::Cli::parse();
    run_server(cli.config).await
}

async fn run_server(config: haas_broker::config::Config) -> Result<()> {
    let store = haas_broker::store::BrokerStore::load_or_init(&config.data_dir)?;
    let store = Arc::new(Mutex::new(store));

    let dispenser: Arc<dyn haas_broker::dispenser::Dispenser> =
        Arc::new(haas_broker::dispenser::HttpDispenser::new(
            &config.dispenser_url,
            &config.dispenser_api_key,
            config.dispenser_timeout(),
        ));

    let app = haas_broker::http::build_router(config.clone(), store, dispenser)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        dispenser_url = %config.dispenser_url,
        "starting haas-broker"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
