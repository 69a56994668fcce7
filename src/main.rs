use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod config;
mod inference;
mod sentiment;

use api::AppState;
use config::ServiceConfig;
use inference::{finbert::FinBertClassifier, snapshot};
use sentiment::SentimentService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = ServiceConfig::from_env()?;

    // -----------------------------
    // Model
    // -----------------------------
    println!("Loading FinBERT model...");
    let sentiment = match load_classifier(&cfg).await {
        Ok(model) => {
            println!("FinBERT model loaded successfully!");
            SentimentService::ready(Arc::new(model))
        }
        Err(e) => {
            println!("Error loading model: {e:#}");
            error!(model_id = %cfg.model_id, "model unavailable, /predict will answer 503: {e:#}");
            SentimentService::unavailable()
        }
    };

    let state = AppState {
        sentiment: Arc::new(sentiment),
    };

    // -----------------------------
    // Routers
    // -----------------------------
    let app = Router::new()
        .merge(api::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state);

    let listener = TcpListener::bind(cfg.bind).await?;
    println!("🌐 FinBERT Sentiment Analysis Service on http://{}", cfg.bind);
    info!(addr = %cfg.bind, "listening");

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn load_classifier(cfg: &ServiceConfig) -> anyhow::Result<FinBertClassifier> {
    let files = snapshot::resolve(&cfg.model_id, cfg.snapshot_dir.as_deref()).await?;
    FinBertClassifier::load(&files, &cfg.device, cfg.max_len)
}
