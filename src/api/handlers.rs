use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use tracing::warn;

use super::{error::ApiError, types::HealthResponse, AppState};
use crate::sentiment::{PredictError, SentimentRequest, SentimentResponse};

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "active",
        model_loaded: state.sentiment.model_loaded(),
    })
}

pub async fn predict_sentiment(
    State(state): State<AppState>,
    payload: Result<Json<SentimentRequest>, JsonRejection>,
) -> Result<Json<SentimentResponse>, ApiError> {
    // Readiness wins over body validation.
    if !state.sentiment.model_loaded() {
        return Err(PredictError::Unavailable.into());
    }

    let Json(req) = payload.map_err(|rejection| {
        warn!("rejected /predict body: {}", rejection.body_text());
        rejection
    })?;

    let resp = state.sentiment.predict(req.text).await?;
    Ok(Json(resp))
}
