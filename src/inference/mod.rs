pub mod finbert;
pub mod snapshot;

use anyhow::Result;

/// Top class of a single forward pass, before domain mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPrediction {
    pub label: String,
    pub confidence: f32,
}

/// A loaded three-class sentiment classifier.
///
/// Implementations are immutable once loaded and are shared across request
/// handlers, so `classify` takes `&self` and may be called from several
/// blocking threads at once.
pub trait SentimentModel: Send + Sync {
    fn classify(&self, text: &str) -> Result<RawPrediction>;
}
