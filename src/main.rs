use axum::http::{header, HeaderName, Method};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reconciliation_rs::config::Config;
use reconciliation_rs::metrics::Metrics;
use reconciliation_rs::processor::PaymentProcessor;
use reconciliation_rs::stripe::{StripeClient, StripeConfig};
use reconciliation_rs::webhooks::sweeper::run_sweeper;
use reconciliation_rs::{build_router, db, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reconciliation_rs=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cfg = Config::from_env()?;
    tracing::info!("config loaded");

    let pool = db::create_pool(&cfg.database_url, cfg.db_max_connections, cfg.db_acquire_timeout).await?;
    db::run_migrations(&pool).await?;
    tracing::info!("db connected + migrations applied");

    let processor: Arc<dyn PaymentProcessor> =
        Arc::new(StripeClient::new(StripeConfig::from_app_config(&cfg))?);
    let metrics = Metrics::new()?;

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let sweeper_interval = cfg.sweeper_interval;
    let sweeper_batch = cfg.sweeper_batch_size;
    let state = AppState::new(pool, cfg, processor, metrics);

    tokio::spawn(run_sweeper(state.webhooks.clone(), sweeper_interval, sweeper_batch));
    tracing::info!(interval_secs = sweeper_interval.as_secs(), "retry sweeper started");

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("stripe-signature"),
        ]);

    let app = build_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
