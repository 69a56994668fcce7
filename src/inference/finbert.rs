use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{anyhow, Context, Result};
use candle::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use serde::Deserialize;
use tokenizers::{
    models::wordpiece::WordPiece,
    normalizers::{bert::BertNormalizer, NormalizerWrapper},
    pre_tokenizers::{bert::BertPreTokenizer, PreTokenizerWrapper},
    processors::{bert::BertProcessing, PostProcessorWrapper},
    Tokenizer, TruncationParams,
};
use tracing::{info, warn};

use super::{
    snapshot::{ModelFiles, TokenizerSource},
    RawPrediction, SentimentModel,
};
use crate::sentiment::labels::DEFAULT_RAW_LABELS;

const NUM_CLASSES: usize = 3;

/// `BertForSequenceClassification` checkpoint: encoder, tanh pooler over
/// `[CLS]`, linear head.
pub struct FinBertClassifier {
    model: BertModel,
    pooler: Linear,
    classifier: Linear,
    tokenizer: Tokenizer,
    device: Device,
    labels: Vec<String>,
}

/// Fields of `config.json` that `BertConfig` does not carry.
#[derive(Debug, Default, Deserialize)]
struct HeadConfig {
    #[serde(default)]
    id2label: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct TokenizerConfig {
    #[serde(default = "default_lower_case")]
    do_lower_case: bool,
}

fn default_lower_case() -> bool {
    true
}

impl FinBertClassifier {
    pub fn load(files: &ModelFiles, device_pref: &str, max_len: usize) -> Result<Self> {
        let device = build_device(device_pref)?;
        info!(?device, weights = %files.weights.display(), "loading FinBERT classifier");

        let raw = fs::read(&files.config)
            .with_context(|| format!("failed to read {}", files.config.display()))?;
        let config: BertConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", files.config.display()))?;
        let head: HeadConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", files.config.display()))?;

        let labels = label_order(head.id2label)?;
        if labels.len() != NUM_CLASSES {
            return Err(anyhow!(
                "expected a {NUM_CLASSES}-class head, config declares {} labels",
                labels.len()
            ));
        }

        let max_len = max_len.min(config.max_position_embeddings).max(2);
        let tokenizer = load_tokenizer(&files.tokenizer, max_len)?;

        let vb = build_var_builder(&files.weights, &device)?;
        let model = BertModel::load(vb.pp("bert"), &config)?;
        let pooler = candle_nn::linear(
            config.hidden_size,
            config.hidden_size,
            vb.pp("bert.pooler.dense"),
        )?;
        let classifier = candle_nn::linear(config.hidden_size, labels.len(), vb.pp("classifier"))?;

        info!(max_len, labels = ?labels, "FinBERT classifier ready");

        Ok(Self {
            model,
            pooler,
            classifier,
            tokenizer,
            device,
            labels,
        })
    }

    /// Softmax distribution over the head's classes, in `id2label` order.
    pub fn probabilities(&self, text: &str) -> Result<Vec<f32>> {
        let enc = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;
        let ids = enc.get_ids();
        if ids.is_empty() {
            return Err(anyhow!("tokenizer produced an empty encoding"));
        }

        let input = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(enc.get_type_ids(), &self.device)?.unsqueeze(0)?;
        let mask = Tensor::new(enc.get_attention_mask(), &self.device)?.unsqueeze(0)?;

        let hidden = self.model.forward(&input, &token_type_ids, Some(&mask))?;
        let cls = hidden.i((.., 0))?;
        let pooled = self.pooler.forward(&cls)?.tanh()?;
        let logits = self.classifier.forward(&pooled)?.squeeze(0)?;
        let probs = candle_nn::ops::softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;

        Ok(probs.to_vec1::<f32>()?)
    }
}

impl SentimentModel for FinBertClassifier {
    fn classify(&self, text: &str) -> Result<RawPrediction> {
        let probs = self.probabilities(text)?;
        let (idx, confidence) = top_class(&probs)?;
        let label = self
            .labels
            .get(idx)
            .cloned()
            .ok_or_else(|| anyhow!("class index {idx} has no label"))?;
        Ok(RawPrediction { label, confidence })
    }
}

/// Raw labels ordered by class index.
///
/// `id2label` keys are stringified indices and must cover `0..n` without gaps.
/// Checkpoints without the map get the stock FinBERT ordering.
fn label_order(id2label: Option<BTreeMap<String, String>>) -> Result<Vec<String>> {
    let Some(map) = id2label.filter(|m| !m.is_empty()) else {
        return Ok(DEFAULT_RAW_LABELS.iter().map(|l| l.to_string()).collect());
    };

    let mut indexed = map
        .into_iter()
        .map(|(k, v)| {
            k.trim()
                .parse::<usize>()
                .map(|idx| (idx, v))
                .map_err(|_| anyhow!("id2label key {k:?} is not a class index"))
        })
        .collect::<Result<Vec<_>>>()?;
    indexed.sort_by_key(|(idx, _)| *idx);

    for (expected, (idx, _)) in indexed.iter().enumerate() {
        if *idx != expected {
            return Err(anyhow!("id2label is missing class index {expected}"));
        }
    }

    Ok(indexed.into_iter().map(|(_, label)| label).collect())
}

fn top_class(probs: &[f32]) -> Result<(usize, f32)> {
    let (idx, value) = probs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| anyhow!("empty logits"))?;
    Ok((idx, *value))
}

fn load_tokenizer(source: &TokenizerSource, max_len: usize) -> Result<Tokenizer> {
    let mut tokenizer = match source {
        TokenizerSource::Json(path) => Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Tokenizer load failed ({}): {e}", path.display()))?,
        TokenizerSource::WordPiece {
            vocab,
            tokenizer_config,
        } => {
            let lowercase = match tokenizer_config {
                Some(path) => {
                    let raw = fs::read(path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    serde_json::from_slice::<TokenizerConfig>(&raw)
                        .with_context(|| format!("failed to parse {}", path.display()))?
                        .do_lower_case
                }
                None => true,
            };
            wordpiece_tokenizer(vocab, lowercase)?
        }
    };

    tokenizer.with_padding(None);
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: max_len,
            ..Default::default()
        }))
        .map_err(|e| anyhow!("Tokenizer truncation config failed: {e}"))?;

    Ok(tokenizer)
}

/// Standard uncased BERT pipeline: clean + lowercase, split on whitespace and
/// punctuation, WordPiece, then `[CLS] ... [SEP]`.
fn wordpiece_tokenizer(vocab: &Path, lowercase: bool) -> Result<Tokenizer> {
    let wordpiece = WordPiece::from_file(
        vocab
            .to_str()
            .ok_or_else(|| anyhow!("Invalid vocab path"))?,
    )
    .unk_token("[UNK]".to_string())
    .build()
    .map_err(|e| anyhow!("WordPiece tokenizer build error: {e}"))?;

    let mut tokenizer = Tokenizer::new(wordpiece);
    tokenizer.with_normalizer(Some(NormalizerWrapper::BertNormalizer(BertNormalizer::new(
        true, true, None, lowercase,
    ))));
    tokenizer.with_pre_tokenizer(Some(PreTokenizerWrapper::BertPreTokenizer(BertPreTokenizer)));

    let special = |token: &str| {
        tokenizer
            .token_to_id(token)
            .map(|id| (token.to_string(), id))
            .ok_or_else(|| anyhow!("{token} missing from {}", vocab.display()))
    };
    let sep = special("[SEP]")?;
    let cls = special("[CLS]")?;
    tokenizer.with_post_processor(Some(PostProcessorWrapper::Bert(BertProcessing::new(sep, cls))));

    Ok(tokenizer)
}

fn build_var_builder(path: &Path, device: &Device) -> Result<VarBuilder<'static>> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if ext == "safetensors" {
        let files = vec![path.to_path_buf()];
        // SAFETY: the snapshot files are not modified while the process runs.
        unsafe {
            VarBuilder::from_mmaped_safetensors(&files, DType::F32, device)
                .map_err(|e| anyhow!("failed to load {}: {e}", path.display()))
        }
    } else {
        VarBuilder::from_pth(path, DType::F32, device)
            .map_err(|e| anyhow!("failed to load {}: {e}", path.display()))
    }
}

fn build_device(pref: &str) -> Result<Device> {
    let trimmed = pref.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.is_empty() || lower == "cpu" {
        Ok(Device::Cpu)
    } else if lower.starts_with("cuda") || lower.starts_with("gpu") {
        let ordinal = trimmed
            .split(':')
            .nth(1)
            .and_then(|part| part.parse::<usize>().ok())
            .unwrap_or(0);
        Device::new_cuda(ordinal).map_err(|err| {
            anyhow!(
                "requested CUDA device {ordinal} but initialization failed: {err}. \
                 Build with the `cuda` feature and ensure CUDA libraries are available."
            )
        })
    } else {
        warn!("unrecognized FINBERT_DEVICE value '{trimmed}', defaulting to cpu");
        Ok(Device::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn id2label(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn label_order_follows_class_index() {
        let labels = label_order(id2label(&[
            ("2", "neutral"),
            ("0", "positive"),
            ("1", "negative"),
        ]))
        .unwrap();
        assert_eq!(labels, vec!["positive", "negative", "neutral"]);
    }

    #[test]
    fn label_order_sorts_numerically_not_lexically() {
        let pairs: Vec<(String, String)> =
            (0..11).map(|i| (i.to_string(), format!("c{i}"))).collect();
        let map = pairs.into_iter().collect();
        let labels = label_order(Some(map)).unwrap();
        assert_eq!(labels[2], "c2");
        assert_eq!(labels[10], "c10");
    }

    #[test]
    fn label_order_defaults_without_id2label() {
        assert_eq!(label_order(None).unwrap(), DEFAULT_RAW_LABELS);
        assert_eq!(label_order(Some(BTreeMap::new())).unwrap(), DEFAULT_RAW_LABELS);
    }

    #[test]
    fn label_order_rejects_gaps_and_bad_keys() {
        assert!(label_order(id2label(&[("0", "a"), ("2", "b")])).is_err());
        assert!(label_order(id2label(&[("zero", "a")])).is_err());
    }

    #[test]
    fn top_class_picks_highest_probability() {
        let (idx, p) = top_class(&[0.1, 0.7, 0.2]).unwrap();
        assert_eq!(idx, 1);
        assert!((p - 0.7).abs() < f32::EPSILON);
        assert!(top_class(&[]).is_err());
    }

    #[test]
    fn device_preference_parsing() {
        assert!(matches!(build_device("cpu").unwrap(), Device::Cpu));
        assert!(matches!(build_device("  CPU ").unwrap(), Device::Cpu));
        assert!(matches!(build_device("tpu").unwrap(), Device::Cpu));
    }

    #[test]
    fn wordpiece_fallback_adds_specials_and_truncates() {
        let dir = std::env::temp_dir().join(format!("finbert-vocab-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let vocab = dir.join("vocab.txt");
        fs::write(
            &vocab,
            "[PAD]\n[UNK]\n[CLS]\n[SEP]\n[MASK]\nprofits\nrose\nsharply\n.\n",
        )
        .unwrap();

        let source = TokenizerSource::WordPiece {
            vocab,
            tokenizer_config: None,
        };
        let tokenizer = load_tokenizer(&source, 4).unwrap();

        let enc = tokenizer.encode("Profits rose", true).unwrap();
        assert_eq!(enc.get_tokens(), &["[CLS]", "profits", "rose", "[SEP]"]);

        let enc = tokenizer.encode("Profits rose sharply.", true).unwrap();
        assert_eq!(enc.get_ids().len(), 4);
        assert_eq!(enc.get_tokens().first().map(String::as_str), Some("[CLS]"));
        assert_eq!(enc.get_tokens().last().map(String::as_str), Some("[SEP]"));

        fs::remove_dir_all(&dir).unwrap();
    }

    const TINY_VOCAB: &str =
        "[PAD]\n[UNK]\n[CLS]\n[SEP]\n[MASK]\nrevenue\ngrew\nprofits\nfell\nthe\ncompany\n.\n";

    /// Writes a randomly initialised 1-layer BERT classifier with `head_outputs`
    /// classes, laid out like a hub snapshot.
    fn tiny_snapshot(name: &str, id2label: serde_json::Value, head_outputs: usize) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("finbert-tiny-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let config_json = serde_json::json!({
            "vocab_size": 12,
            "hidden_size": 8,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "intermediate_size": 16,
            "hidden_act": "gelu",
            "hidden_dropout_prob": 0.1,
            "attention_probs_dropout_prob": 0.1,
            "max_position_embeddings": 16,
            "type_vocab_size": 2,
            "initializer_range": 0.02,
            "layer_norm_eps": 1e-12,
            "pad_token_id": 0,
            "model_type": "bert",
            "id2label": id2label,
        });
        let config: BertConfig = serde_json::from_value(config_json.clone()).unwrap();

        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        BertModel::load(vb.pp("bert"), &config).unwrap();
        candle_nn::linear(8, 8, vb.pp("bert.pooler.dense")).unwrap();
        candle_nn::linear(8, head_outputs, vb.pp("classifier")).unwrap();
        varmap.save(dir.join("model.safetensors")).unwrap();

        fs::write(dir.join("config.json"), config_json.to_string()).unwrap();
        fs::write(dir.join("vocab.txt"), TINY_VOCAB).unwrap();
        dir
    }

    fn load_tiny(dir: &Path) -> Result<FinBertClassifier> {
        let files = crate::inference::snapshot::from_dir(dir)?;
        FinBertClassifier::load(&files, "cpu", 512)
    }

    #[test]
    fn tiny_checkpoint_classifies_into_a_distribution() {
        let dir = tiny_snapshot(
            "three",
            serde_json::json!({"0": "positive", "1": "negative", "2": "neutral"}),
            3,
        );
        let model = load_tiny(&dir).expect("tiny checkpoint should load");

        let text = "The company revenue grew.";
        let probs = model.probabilities(text).unwrap();
        assert_eq!(probs.len(), 3);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-4);

        let first = model.classify(text).unwrap();
        assert!((0.0..=1.0).contains(&first.confidence));
        assert!(DEFAULT_RAW_LABELS.contains(&first.label.as_str()));
        assert_eq!(first, model.classify(text).unwrap());

        let max = probs.iter().cloned().fold(f32::MIN, f32::max);
        assert!((first.confidence - max).abs() < 1e-6);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn tiny_checkpoint_truncates_long_and_accepts_empty_input() {
        let dir = tiny_snapshot("long", serde_json::Value::Null, 3);
        let model = load_tiny(&dir).expect("tiny checkpoint should load");

        // Far past the 16 position embeddings.
        let long = "revenue grew ".repeat(300);
        let pred = model.classify(&long).expect("long input is truncated, not rejected");
        assert!((0.0..=1.0).contains(&pred.confidence));

        assert!(model.classify("").is_ok());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_rejects_heads_that_are_not_three_class() {
        let dir = tiny_snapshot(
            "two-labels",
            serde_json::json!({"0": "up", "1": "down"}),
            2,
        );
        let err = load_tiny(&dir).err().expect("2-label head must not load");
        assert!(err.to_string().contains("3-class"), "{err}");
        fs::remove_dir_all(&dir).unwrap();

        // Default label table says 3, weights say 2.
        let dir = tiny_snapshot("two-outputs", serde_json::Value::Null, 2);
        assert!(load_tiny(&dir).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn run_finbert_classification() {
        let snapshot = PathBuf::from("models/finbert");
        if !snapshot.join("config.json").exists() {
            eprintln!(
                "FinBERT snapshot missing under {}, skipping test",
                snapshot.display()
            );
            return;
        }
        let files = crate::inference::snapshot::from_dir(&snapshot).expect("snapshot files");
        let model = FinBertClassifier::load(&files, "cpu", 512).expect("failed to load FinBERT");

        let text = "The company reported record profits this quarter.";
        let first = model.classify(text).expect("inference failed");
        let second = model.classify(text).expect("inference failed");

        assert_eq!(first.label, "positive");
        assert!((0.0..=1.0).contains(&first.confidence));
        assert_eq!(first, second);

        let probs = model.probabilities(text).unwrap();
        assert_eq!(probs.len(), model.labels.len());
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-4);

        let long = "Revenue grew. ".repeat(2_000);
        assert!(model.classify(&long).is_ok());
    }
}
