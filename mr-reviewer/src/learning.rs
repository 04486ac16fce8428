//! Learning blocks embedded in model replies.
//!
//! A reply may carry one fenced block (` ```learning `, or ` ```json ` as a
//! fallback) with a JSON object describing something worth remembering. The
//! block is never shown to users: it is cut out of the reply and, when its
//! payload decodes, replaced by a one-line acknowledgment at the end.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

const FENCE_MARKERS: &[&str] = &["```learning", "```json"];
const FENCE_CLOSE: &str = "```";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LearningMetadata {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    /// Falls back to the title when the payload has no content.
    pub content: String,
    pub tags: Vec<String>,
    pub scope: String,
    pub confidence: f64,
}

/// Splits `reply` into the user-facing text and the learning payload.
///
/// Without a complete block (marker, newline, closing fence) the reply is
/// returned untouched. A complete block is always removed; the metadata is
/// `None` when its payload is not a JSON object.
pub fn extract_learning(reply: &str) -> (String, Option<LearningMetadata>) {
    let Some((start, marker_len)) = find_block(reply) else {
        return (reply.to_string(), None);
    };

    let after_marker = &reply[start + marker_len..];
    let Some(newline) = after_marker.find('\n') else {
        return (reply.to_string(), None);
    };

    let payload_start = start + marker_len + newline + 1;
    let remaining = &reply[payload_start..];
    let Some(end) = remaining.find(FENCE_CLOSE) else {
        return (reply.to_string(), None);
    };

    let payload = remaining[..end].trim();
    let cleaned = format!("{}{}", &reply[..start], &remaining[end + FENCE_CLOSE.len()..]);
    let learning = parse_payload(payload);
    debug!(parsed = learning.is_some(), "learning block stripped from reply");

    (cleaned.trim().to_string(), learning)
}

/// Short user-facing note for a captured learning.
pub fn format_acknowledgment(learning: &LearningMetadata) -> String {
    if learning.title.is_empty() {
        "💡 *Learning opportunity noted for future reference.*".to_string()
    } else {
        format!("💡 *Learning captured: {}*", learning.title)
    }
}

/// Strips any learning block from `reply` and appends the acknowledgment
/// when the block decoded.
pub fn append_learning_acknowledgment(reply: &str) -> (String, Option<LearningMetadata>) {
    let (cleaned, learning) = extract_learning(reply);
    let cleaned = cleaned.trim();

    let Some(learning) = learning else {
        return (cleaned.to_string(), None);
    };

    let ack = format_acknowledgment(&learning);
    let body = if cleaned.is_empty() {
        ack
    } else {
        format!("{cleaned}\n\n{ack}")
    };
    (body, Some(learning))
}

fn find_block(reply: &str) -> Option<(usize, usize)> {
    FENCE_MARKERS
        .iter()
        .find_map(|marker| reply.find(marker).map(|idx| (idx, marker.len())))
}

/// Tolerant decoder: any JSON object is accepted, fields of the wrong shape
/// are coerced or left empty.
fn parse_payload(raw: &str) -> Option<LearningMetadata> {
    if raw.is_empty() {
        return None;
    }
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(raw) else {
        return None;
    };

    let title = string_field(&obj, "title");
    let content = match string_field(&obj, "content") {
        c if c.is_empty() => title.clone(),
        c => c,
    };

    Some(LearningMetadata {
        kind: string_field(&obj, "type"),
        title,
        content,
        tags: tags_field(&obj),
        scope: string_field(&obj, "scope"),
        confidence: number_field(&obj, "confidence"),
    })
}

fn string_field(obj: &Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn number_field(obj: &Map<String, Value>, key: &str) -> f64 {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
        Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
        _ => 0.0,
    }
}

/// Accepts an array of strings or one comma separated string.
fn tags_field(obj: &Map<String, Value>) -> Vec<String> {
    match obj.get("tags") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = "Use a bounded channel here.\n\n```learning\n{\"type\": \"best_practice\", \"title\": \"Prefer bounded channels\", \"tags\": [\"async\", \"backpressure\"], \"scope\": \"repository\", \"confidence\": 0.8}\n```\n";

    #[test]
    fn strips_block_and_acknowledges() {
        let (body, learning) = append_learning_acknowledgment(REPLY);

        let learning = learning.unwrap();
        assert_eq!(learning.kind, "best_practice");
        assert_eq!(learning.content, "Prefer bounded channels");
        assert_eq!(learning.tags, vec!["async", "backpressure"]);
        assert!((learning.confidence - 0.8).abs() < f64::EPSILON);

        assert_eq!(
            body,
            "Use a bounded channel here.\n\n💡 *Learning captured: Prefer bounded channels*"
        );
        assert!(!body.contains("```"));
    }

    #[test]
    fn broken_payload_is_stripped_without_acknowledgment() {
        let reply = "Looks fine.\n```learning\n{not json\n```";
        let (body, learning) = append_learning_acknowledgment(reply);

        assert!(learning.is_none());
        assert_eq!(body, "Looks fine.");
    }

    #[test]
    fn json_fence_is_a_fallback_marker() {
        let reply = "Noted.\n```json\n{\"content\": \"retry with jitter\", \"tags\": \"net, retry\"}\n```\nThanks!";
        let (cleaned, learning) = extract_learning(reply);

        let learning = learning.unwrap();
        assert_eq!(learning.tags, vec!["net", "retry"]);
        assert!(learning.title.is_empty());
        assert_eq!(cleaned, "Noted.\n\nThanks!");
        assert_eq!(
            format_acknowledgment(&learning),
            "💡 *Learning opportunity noted for future reference.*"
        );
    }

    #[test]
    fn unterminated_block_leaves_reply_alone() {
        let reply = "Answer\n```learning\n{\"title\": \"x\"}";
        let (cleaned, learning) = extract_learning(reply);
        assert_eq!(cleaned, reply);
        assert!(learning.is_none());
    }
}
