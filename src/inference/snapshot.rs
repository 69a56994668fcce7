use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

const WEIGHT_CANDIDATES: &[&str] = &["model.safetensors", "pytorch_model.bin"];

/// Where the tokenizer definition comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenizerSource {
    /// Serialized fast tokenizer.
    Json(PathBuf),
    /// Plain BERT vocabulary; the WordPiece pipeline is assembled in code.
    WordPiece {
        vocab: PathBuf,
        tokenizer_config: Option<PathBuf>,
    },
}

/// Resolved on-disk files for one classifier checkpoint.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: TokenizerSource,
    pub weights: PathBuf,
}

/// Uses the local snapshot when one is configured, otherwise pulls the files
/// from the Hugging Face Hub cache (downloading on first use).
pub async fn resolve(model_id: &str, snapshot_dir: Option<&Path>) -> Result<ModelFiles> {
    match snapshot_dir {
        Some(dir) => {
            info!(snapshot = %dir.display(), "using local model snapshot");
            from_dir(dir)
        }
        None => {
            info!(model_id, "resolving model from the Hugging Face Hub");
            from_hub(model_id).await
        }
    }
}

pub fn from_dir(snapshot: &Path) -> Result<ModelFiles> {
    let config = snapshot.join("config.json");
    if !config.exists() {
        return Err(anyhow!(
            "config.json not found under {}",
            snapshot.display()
        ));
    }

    let tokenizer_json = snapshot.join("tokenizer.json");
    let tokenizer = if tokenizer_json.exists() {
        TokenizerSource::Json(tokenizer_json)
    } else {
        let vocab = snapshot.join("vocab.txt");
        if !vocab.exists() {
            return Err(anyhow!(
                "neither tokenizer.json nor vocab.txt found under {}",
                snapshot.display()
            ));
        }
        let tokenizer_config = Some(snapshot.join("tokenizer_config.json")).filter(|p| p.exists());
        TokenizerSource::WordPiece {
            vocab,
            tokenizer_config,
        }
    };

    let weights = WEIGHT_CANDIDATES
        .iter()
        .map(|name| snapshot.join(name))
        .find(|path| path.exists())
        .ok_or_else(|| anyhow!("no model weights found under {}", snapshot.display()))?;

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

async fn from_hub(model_id: &str) -> Result<ModelFiles> {
    let api = hf_hub::api::tokio::ApiBuilder::new()
        .build()
        .context("failed to build Hugging Face Hub client")?;
    let repo = api.model(model_id.to_string());

    let config = repo
        .get("config.json")
        .await
        .with_context(|| format!("failed to fetch config.json from {model_id}"))?;

    let tokenizer = match repo.get("tokenizer.json").await {
        Ok(path) => TokenizerSource::Json(path),
        Err(err) => {
            debug!(model_id, "no tokenizer.json ({err}), falling back to vocab.txt");
            let vocab = repo
                .get("vocab.txt")
                .await
                .with_context(|| format!("failed to fetch vocab.txt from {model_id}"))?;
            let tokenizer_config = repo.get("tokenizer_config.json").await.ok();
            TokenizerSource::WordPiece {
                vocab,
                tokenizer_config,
            }
        }
    };

    let mut last_err = None;
    for name in WEIGHT_CANDIDATES {
        match repo.get(name).await {
            Ok(weights) => {
                return Ok(ModelFiles {
                    config,
                    tokenizer,
                    weights,
                })
            }
            Err(err) => {
                debug!(model_id, file = name, "weights not available: {err}");
                last_err = Some(err);
            }
        }
    }

    Err(anyhow!(
        "no model weights available for {model_id}: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}
