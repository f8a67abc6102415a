//! Strict JSON extraction from LLM replies.
//!
//! Model output is never trusted to be pure JSON. The extractor locates
//! the first balanced `{...}` span, tracking string literals and escape
//! sequences so braces inside strings do not confuse the scan, then
//! parses strictly.

use serde::de::DeserializeOwned;

use crate::error::{PipelineError, Result};

/// Locate the first balanced top-level JSON object in `text`.
pub fn first_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract and strictly parse the first JSON object in an LLM reply.
pub fn extract_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    let span = first_json_object(text)
        .ok_or_else(|| PipelineError::Upstream("no JSON object in model reply".into()))?;
    serde_json::from_str(span)
        .map_err(|e| PipelineError::Upstream(format!("model reply is not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Kind {
        kind: String,
        confidence: f64,
    }

    #[test]
    fn test_pure_json() {
        let parsed: Kind = extract_json(r#"{"kind": "blueprint", "confidence": 0.9}"#).unwrap();
        assert_eq!(parsed.kind, "blueprint");
    }

    #[test]
    fn test_json_with_preamble_and_trailer() {
        let text = r#"Sure! Here is the classification you asked for:

{"kind": "blueprint", "confidence": 0.9}

Let me know if you need anything else."#;
        let parsed: Kind = extract_json(text).unwrap();
        assert_eq!(parsed.kind, "blueprint");
        assert!((parsed.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_braces_inside_strings() {
        let text = r#"note {"kind": "has { and } inside", "confidence": 1.0} tail"#;
        let parsed: Kind = extract_json(text).unwrap();
        assert_eq!(parsed.kind, "has { and } inside");
    }

    #[test]
    fn test_escaped_quotes_inside_strings() {
        let text = r#"{"kind": "say \"hi\" {", "confidence": 0.5}"#;
        let parsed: Kind = extract_json(text).unwrap();
        assert_eq!(parsed.kind, "say \"hi\" {");
    }

    #[test]
    fn test_nested_objects() {
        let text = r#"{"outer": {"inner": 1}, "kind": "x", "confidence": 0.1}"#;
        let span = first_json_object(text).unwrap();
        assert_eq!(span, text);
    }

    #[test]
    fn test_picks_first_object() {
        let text = r#"{"kind": "a", "confidence": 0.1} {"kind": "b", "confidence": 0.2}"#;
        let parsed: Kind = extract_json(text).unwrap();
        assert_eq!(parsed.kind, "a");
    }

    #[test]
    fn test_no_object_is_error() {
        assert!(extract_json::<Kind>("the roof is probably a blueprint").is_err());
    }

    #[test]
    fn test_unbalanced_is_error() {
        assert!(extract_json::<Kind>(r#"{"kind": "a", "confidence":"#).is_err());
    }
}
