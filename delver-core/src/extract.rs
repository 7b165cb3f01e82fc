//! Structured extraction from free-form model output.
//!
//! Every model call expected to yield structured output goes through the
//! same ladder: strict JSON, then a fenced-block pass, then a lenient
//! brace-window pass over prose. Callers fall back to a schema-specific
//! default when all passes fail; parsing never blocks the pipeline.

use serde::de::DeserializeOwned;

/// Try to recover a JSON value from model output.
pub fn parse_json_lenient(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();

    // 1. Strict parse of the whole output.
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    // 2. Fenced code block, with or without a language tag.
    if let Some(inner) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(inner.trim()) {
            return Some(value);
        }
    }

    // 3. Widest brace window inside prose.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Deserialize model output into `T`, or `None` if no pass yields a value
/// matching the schema.
pub fn extract<T: DeserializeOwned>(text: &str) -> Option<T> {
    let value = parse_json_lenient(text)?;
    serde_json::from_value(value).ok()
}

/// The contents of the first ``` fence pair, if any.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    // Skip a language tag on the fence line.
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Verdict {
        ok: bool,
        score: f64,
    }

    #[test]
    fn test_strict_json() {
        let v: Verdict = extract(r#"{"ok": true, "score": 4.5}"#).unwrap();
        assert_eq!(v, Verdict { ok: true, score: 4.5 });
    }

    #[test]
    fn test_fenced_json() {
        let text = "Here is my answer:\n```json\n{\"ok\": false, \"score\": 1.0}\n```\nDone.";
        let v: Verdict = extract(text).unwrap();
        assert!(!v.ok);
    }

    #[test]
    fn test_json_embedded_in_prose() {
        let text = "Sure! The result is {\"ok\": true, \"score\": 3.0} as requested.";
        let v: Verdict = extract(text).unwrap();
        assert!((v.score - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unparseable_returns_none() {
        assert!(extract::<Verdict>("no json here at all").is_none());
        assert!(extract::<Verdict>("{broken json").is_none());
    }

    #[test]
    fn test_schema_mismatch_returns_none() {
        // Valid JSON, wrong shape.
        assert!(extract::<Verdict>(r#"{"verdict": "yes"}"#).is_none());
    }

    #[test]
    fn test_fence_without_language_tag() {
        let text = "```\n{\"ok\": true, \"score\": 2.0}\n```";
        let v: Verdict = extract(text).unwrap();
        assert!(v.ok);
    }

    #[test]
    fn test_ignores_extra_fields() {
        let v: Verdict = extract(r#"{"ok": true, "score": 5.0, "note": "extra"}"#).unwrap();
        assert!(v.ok);
    }
}
