use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use confluence_scanner::{ConfluenceScanner, Settings, TradingViewClient};

/// Application state shared across handlers
pub struct AppState {
    pub scanner: ConfluenceScanner,
    pub export_columns: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting Confluence Scanner...");

    let settings = Settings::load()?;

    let provider = Arc::new(TradingViewClient::new(&settings.provider)?);
    info!(
        "✓ TradingView client initialized ({}, market {})",
        settings.provider.base_url, settings.scan.market
    );

    let scanner = ConfluenceScanner::new(provider, settings.scan.clone())?;
    for rule in scanner.filter().rules().rules() {
        info!("  rule: {}", rule);
    }
    info!(
        "✓ {} rules, {:?} fetch mode",
        scanner.filter().rules().len(),
        scanner.settings().fetch_mode
    );

    let state = Arc::new(AppState {
        scanner,
        export_columns: settings.export.columns.clone(),
    });

    // Build router
    let app = Router::new()
        .route("/scan", post(handlers::scan))
        .route("/scan/upload", post(handlers::scan_upload))
        .route("/scan/refine", post(handlers::refine_scan))
        .route("/scan/export", post(handlers::export_csv))
        .route("/rules", get(handlers::get_rules))
        .route("/health", get(handlers::health_check))
        .layer(CorsLayer::new().allow_origin(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", settings.port)).await?;
    info!("🚀 Confluence Scanner listening on port {}", settings.port);

    axum::serve(listener, app).await?;

    Ok(())
}

mod handlers;
