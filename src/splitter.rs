//! Separates the conversational reply from the trailing ```json triage block.

use regex::Regex;
use std::sync::OnceLock;

use crate::models::{SplitReply, TriageVerdict};

const FENCE_OPEN: &str = "```json";

/// Matches a json-tagged fenced block that runs to the end of the input.
fn trailing_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?si)\A```json[ \t]*\r?\n?(.*?)\s*```\s*\z")
            .expect("trailing block pattern is a valid regex")
    })
}

/// Split a raw model reply into display text and an optional verdict.
///
/// Only a block that closes the reply counts; JSON quoted earlier in the text
/// is left alone. If the block is present but cannot be read as a verdict
/// (invalid JSON, not an object, missing `topic`/`urgency`), the raw text is
/// returned untouched with no verdict. Only one block is removed: a reply
/// ending in two consecutive json blocks keeps the first one in its text.
pub fn split(raw: &str) -> SplitReply {
    let Some((start, body)) = locate_trailing_block(raw) else {
        return unparsed(raw);
    };

    match parse_verdict(body) {
        Some(verdict) => SplitReply {
            text: raw[..start].trim().to_string(),
            triage: Some(verdict),
        },
        None => {
            tracing::debug!("Trailing json block present but not a valid verdict");
            unparsed(raw)
        }
    }
}

fn unparsed(raw: &str) -> SplitReply {
    SplitReply {
        text: raw.to_string(),
        triage: None,
    }
}

/// Byte offset of the opening fence and the block body, if the reply ends with one.
fn locate_trailing_block(raw: &str) -> Option<(usize, &str)> {
    let lower = raw.to_ascii_lowercase();
    let start = lower.rfind(FENCE_OPEN)?;
    let caps = trailing_block().captures(&raw[start..])?;
    let body = caps.get(1)?.as_str();
    Some((start, body))
}

fn parse_verdict(body: &str) -> Option<TriageVerdict> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    if !value.is_object() {
        return None;
    }
    match serde_json::from_value::<TriageVerdict>(value) {
        Ok(verdict) if !verdict.topic.trim().is_empty() => Some(verdict),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("Triage JSON rejected: {}", e);
            None
        }
    }
}
