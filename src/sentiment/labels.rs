use std::fmt;

use serde::Serialize;

/// Raw FinBERT classes in the order the upstream checkpoint ships them.
pub const DEFAULT_RAW_LABELS: &[&str] = &["positive", "negative", "neutral"];

/// Label exposed to API consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DomainLabel {
    Bullish,
    Bearish,
    Neutral,
}

impl DomainLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            DomainLabel::Bullish => "Bullish",
            DomainLabel::Bearish => "Bearish",
            DomainLabel::Neutral => "Neutral",
        }
    }
}

impl fmt::Display for DomainLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DOMAIN_TABLE: &[(&str, DomainLabel)] = &[
    ("positive", DomainLabel::Bullish),
    ("negative", DomainLabel::Bearish),
    ("neutral", DomainLabel::Neutral),
];

/// Maps a raw classifier label onto the domain label set.
///
/// Matching ignores case and surrounding whitespace, which is looser than an
/// exact lookup in the table: checkpoints that ship `"Positive"` or
/// `"POSITIVE"` in their `id2label` still land on the right bucket.
/// Anything unrecognised falls back to [`DomainLabel::Neutral`].
pub fn map_raw_label(raw: &str) -> DomainLabel {
    let raw = raw.trim();
    DOMAIN_TABLE
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(raw))
        .map(|(_, label)| *label)
        .unwrap_or(DomainLabel::Neutral)
}
