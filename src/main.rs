mod app_state;
mod config;
mod crypto;
mod db;
mod error;
mod handlers;
mod lightning;
mod payment;
mod tap;
mod withdraw;

use axum::{Router, routing::get};
use clap::Parser;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use app_state::AppState;
use config::Config;
use db::{LedgerStore, init_pool};
use handlers::{lnurlw, register, wallet};
use lightning::{PaymentBackend, PhoenixBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boltcard_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::parse());

    let pool = init_pool(&config.database_url).await?;

    // A missing phoenix password is reported per payment, not at start-up
    let backend: Arc<dyn PaymentBackend> = Arc::new(PhoenixBackend::from_config(&config)?);

    let state = AppState {
        store: LedgerStore::new(pool),
        config: config.clone(),
        backend,
    };

    let mut app = Router::new()
        // Bolt Card Programmer
        .route("/new", get(register::new_card))
        // LNURLw, hit by the point of sale on a tap
        .route("/ln", get(lnurlw::lnurlw_request))
        .route("/cb", get(lnurlw::lnurlw_callback));

    if config.wallet_api {
        app = app.merge(wallet::routes());
    }

    let app = app
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.socket_addr()).await?;

    tracing::info!("Server running on {}", config.socket_addr());
    tracing::info!("Domain: {}", config.domain);
    tracing::info!("LNURLw base: {}", config.lnurlw_base());
    tracing::info!(wallet_api = config.wallet_api, phoenix = %config.phoenix_url, "routes ready");

    axum::serve(listener, app).await?;

    Ok(())
}
