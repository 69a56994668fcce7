use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::sentiment::SentimentService;

pub mod error;
pub mod handlers;
pub mod types;

use handlers::{health_check, predict_sentiment};

#[derive(Clone)]
pub struct AppState {
    pub sentiment: Arc<SentimentService>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/predict", post(predict_sentiment))
}
