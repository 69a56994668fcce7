use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}
