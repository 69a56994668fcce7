pub mod labels;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::inference::SentimentModel;
use labels::{map_raw_label, DomainLabel};

#[derive(Debug, Clone, Deserialize)]
pub struct SentimentRequest {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentimentResponse {
    pub label: DomainLabel,
    pub score: f32,
}

#[derive(Debug, Error)]
pub enum PredictError {
    /// The classifier failed to load at startup.
    #[error("Model not initialized")]
    Unavailable,
    #[error("{0}")]
    Internal(String),
}

/// Immutable context built once at startup and shared by every handler.
///
/// `model` is `None` when loading failed; that is the readiness flag, and it
/// never changes for the life of the process.
pub struct SentimentService {
    model: Option<Arc<dyn SentimentModel>>,
}

impl SentimentService {
    pub fn ready(model: Arc<dyn SentimentModel>) -> Self {
        Self { model: Some(model) }
    }

    pub fn unavailable() -> Self {
        Self { model: None }
    }

    pub fn model_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Runs one classification on the blocking pool and maps the raw class.
    pub async fn predict(&self, text: String) -> Result<SentimentResponse, PredictError> {
        let model = self.model.clone().ok_or(PredictError::Unavailable)?;

        let raw = tokio::task::spawn_blocking(move || model.classify(&text))
            .await
            .map_err(|e| PredictError::Internal(e.to_string()))?
            .map_err(|e| {
                error!("inference failed: {e:#}");
                PredictError::Internal(format!("{e:#}"))
            })?;

        if !(0.0..=1.0).contains(&raw.confidence) {
            return Err(PredictError::Internal(format!(
                "classifier returned invalid confidence {}",
                raw.confidence
            )));
        }

        let label = map_raw_label(&raw.label);
        debug!(raw = %raw.label, %label, score = raw.confidence, "classified");

        Ok(SentimentResponse {
            label,
            score: raw.confidence,
        })
    }
}
