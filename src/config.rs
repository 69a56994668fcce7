use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};

pub const DEFAULT_MODEL_ID: &str = "ProsusAI/finbert";
pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_MAX_LEN: usize = 512;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Hub repository the weights are fetched from.
    pub model_id: String,
    /// Local snapshot with `config.json`, tokenizer and weights. Skips the Hub.
    pub snapshot_dir: Option<PathBuf>,
    /// `cpu`, `cuda` or `cuda:N`.
    pub device: String,
    pub max_len: usize,
    pub bind: SocketAddr,
}

impl ServiceConfig {
    /// Reads `FINBERT_*` variables, with `.env` values already loaded by `main`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let model_id = var("FINBERT_MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string());
        let snapshot_dir = var("FINBERT_SNAPSHOT_DIR").map(PathBuf::from);
        let device = var("FINBERT_DEVICE").unwrap_or_else(|| "cpu".to_string());

        let max_len = match var("FINBERT_MAX_LEN") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|len| *len > 0)
                .with_context(|| format!("FINBERT_MAX_LEN must be a positive integer, got {raw:?}"))?,
            None => DEFAULT_MAX_LEN,
        };

        let bind_raw = var("FINBERT_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw
            .trim()
            .parse::<SocketAddr>()
            .with_context(|| format!("FINBERT_BIND is not a socket address: {bind_raw:?}"))?;

        Ok(Self {
            model_id,
            snapshot_dir,
            device,
            max_len,
            bind,
        })
    }
}
