//! Interpretation of decoded recognizer payloads.
//!
//! The recognizer re-sends the running text of the current segment on every
//! response; when utterance detail is enabled, each utterance carries a
//! `definite` flag marking text the vendor will not revise.

use serde_json::Value;

/// One recognized-text update extracted from a server payload.
#[derive(Debug, Clone, PartialEq)]
pub struct UtteranceResult {
    pub text: String,
    /// True only when the utterance list contains a `definite` entry.
    pub is_definite: bool,
    /// Utterance start in ms, present only on definite results.
    pub start_ms: Option<u64>,
    /// Utterance end in ms, present only on definite results.
    pub end_ms: Option<u64>,
}

/// Vendor field aliases for utterance time bounds — these have shifted
/// between recognizer API versions.
const START_ALIASES: &[&str] = &["start_time", "begin_time", "start"];
const END_ALIASES: &[&str] = &["end_time", "end"];

fn first_u64(utterance: &Value, aliases: &[&str]) -> Option<u64> {
    aliases.iter().find_map(|key| utterance.get(*key)?.as_u64())
}

/// Extract a text result from a decoded payload, if it carries one.
///
/// Returns `None` for payloads without a non-empty `result.text` (keepalive
/// and bookkeeping responses).
pub fn extract_result(payload: &Value) -> Option<UtteranceResult> {
    let result = payload.get("result")?;
    let text = result.get("text")?.as_str()?;
    if text.is_empty() {
        return None;
    }

    let mut out = UtteranceResult {
        text: text.to_string(),
        is_definite: false,
        start_ms: None,
        end_ms: None,
    };

    // Definiteness comes from the utterance list and nowhere else. An empty
    // list is never definite: inferring finality from trailing punctuation
    // produced false positives in production and is disallowed.
    let utterances = result
        .get("utterances")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    for utterance in utterances {
        if utterance.get("definite").and_then(Value::as_bool) == Some(true) {
            out.is_definite = true;
            out.start_ms = first_u64(utterance, START_ALIASES);
            out.end_ms = first_u64(utterance, END_ALIASES);
            break;
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn definite_utterance_supplies_bounds() {
        let payload = json!({
            "result": {
                "text": "hello there",
                "utterances": [
                    {"definite": false, "text": "hello"},
                    {"definite": true, "text": "hello there", "start_time": 100, "end_time": 400},
                ]
            }
        });

        let result = extract_result(&payload).expect("result expected");
        assert!(result.is_definite);
        assert_eq!(result.start_ms, Some(100));
        assert_eq!(result.end_ms, Some(400));
        assert_eq!(result.text, "hello there");
    }

    #[test]
    fn empty_utterance_list_is_never_definite() {
        // Trailing punctuation must not be read as finality.
        let payload = json!({
            "result": {
                "text": "sentence ends here.",
                "utterances": []
            }
        });

        let result = extract_result(&payload).expect("result expected");
        assert!(!result.is_definite);
        assert_eq!(result.start_ms, None);
        assert_eq!(result.end_ms, None);
    }

    #[test]
    fn missing_utterance_list_is_never_definite() {
        let payload = json!({"result": {"text": "still talking"}});
        let result = extract_result(&payload).expect("result expected");
        assert!(!result.is_definite);
    }

    #[test]
    fn time_bound_aliases_are_tried_in_order() {
        let payload = json!({
            "result": {
                "text": "aliased",
                "utterances": [
                    {"definite": true, "begin_time": 250, "end": 900}
                ]
            }
        });

        let result = extract_result(&payload).expect("result expected");
        assert_eq!(result.start_ms, Some(250));
        assert_eq!(result.end_ms, Some(900));
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(extract_result(&json!({"result": {"text": ""}})).is_none());
        assert!(extract_result(&json!({"result": {}})).is_none());
        assert!(extract_result(&json!({})).is_none());
    }

    #[test]
    fn first_definite_entry_wins() {
        let payload = json!({
            "result": {
                "text": "one two",
                "utterances": [
                    {"definite": true, "start_time": 0, "end_time": 300},
                    {"definite": true, "start_time": 300, "end_time": 700},
                ]
            }
        });

        let result = extract_result(&payload).expect("result expected");
        assert_eq!(result.start_ms, Some(0));
        assert_eq!(result.end_ms, Some(300));
    }
}
