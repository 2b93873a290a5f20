//! Offline decoding of payloads supplied all at once.
//!
//! Bulk input is either a JSON export of the scan history (an array of
//! objects with `content` and `_datetime`), a single hex-encoded frame, or a
//! single raw binary frame.

use crate::frame::{FrameDecoder, RawPayload};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

/// Errors that can occur while parsing bulk input
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a JSON array of scan entries")]
    NotAnArray,
}

/// One scan entry from a JSON export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    /// Hex payload; `None` when the entry has no usable `content`.
    pub content: Option<String>,
    /// Sort key; missing timestamps sort first.
    pub timestamp: Option<String>,
}

impl BatchEntry {
    fn from_json(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self {
                content: None,
                timestamp: None,
            };
        };
        let timestamp = obj.get("_datetime").and_then(|v| match v {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        });
        Self {
            content: obj.get("content").and_then(|v| v.as_str()).map(str::to_string),
            timestamp,
        }
    }
}

/// Detected shape of bulk input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkInput {
    Entries(Vec<BatchEntry>),
    Single(RawPayload),
}

fn looks_like_json_array(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with("[{") && trimmed.ends_with("}]")
}

impl BulkInput {
    /// Classify raw input bytes.
    pub fn detect(data: Vec<u8>) -> Result<Self, BatchError> {
        match String::from_utf8(data) {
            Ok(text) if looks_like_json_array(&text) => {
                info!("detected JSON format, parsing as scan entries");
                parse_entries(&text).map(BulkInput::Entries)
            }
            Ok(text) => Ok(BulkInput::Single(RawPayload::Hex(text))),
            Err(e) => Ok(BulkInput::Single(RawPayload::Bytes(e.into_bytes()))),
        }
    }
}

/// Parse a JSON array of scan entries.
pub fn parse_entries(json: &str) -> Result<Vec<BatchEntry>, BatchError> {
    let value: Value = serde_json::from_str(json)?;
    let Value::Array(items) = value else {
        return Err(BatchError::NotAnArray);
    };
    Ok(items.iter().map(BatchEntry::from_json).collect())
}

/// Sort entries by timestamp and decode them in order, concatenating every
/// successful result. Entries without content or that fail to decode are
/// reported and skipped.
pub async fn reassemble(decoder: &FrameDecoder, mut entries: Vec<BatchEntry>) -> String {
    // Content breaks timestamp ties so the result never depends on input order.
    entries.sort_by(|a, b| (&a.timestamp, &a.content).cmp(&(&b.timestamp, &b.content)));

    let total = entries.len();
    let mut combined = String::new();

    for (i, entry) in entries.into_iter().enumerate() {
        let Some(content) = entry.content else {
            warn!(entry = i + 1, "entry is missing 'content' field, skipping");
            continue;
        };

        info!(
            entry = i + 1,
            total,
            datetime = entry.timestamp.as_deref().unwrap_or("unknown"),
            "processing scan entry"
        );

        match decoder.decode(RawPayload::Hex(content)).await {
            Ok(text) => combined.push_str(&text),
            Err(e) => warn!(entry = i + 1, error = %e, "failed to decode entry"),
        }
    }

    combined
}

/// Lines that appear more than once, with their 1-based line numbers, in
/// order of first appearance.
pub fn find_duplicates(text: &str) -> Vec<(String, Vec<usize>)> {
    let mut order: Vec<&str> = Vec::new();
    let mut seen: std::collections::HashMap<&str, Vec<usize>> = std::collections::HashMap::new();

    for (i, line) in text.lines().enumerate() {
        let positions = seen.entry(line).or_default();
        if positions.is_empty() {
            order.push(line);
        }
        positions.push(i + 1);
    }

    order
        .into_iter()
        .filter_map(|line| {
            let positions = seen.remove(line)?;
            (positions.len() > 1).then(|| (line.to_string(), positions))
        })
        .collect()
}

/// Human-readable duplicate report.
pub fn duplicate_report(text: &str) -> String {
    let duplicates = find_duplicates(text);
    if duplicates.is_empty() {
        return "No duplicate messages found.\n".to_string();
    }
    duplicates
        .iter()
        .map(|(line, positions)| {
            format!("Duplicate message warning: Lines {positions:?} are duplicates: \"{line}\"\n")
        })
        .collect()
}
