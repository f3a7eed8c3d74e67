//! Parsing of free-form model text into JSON.
//!
//! Models are asked for bare JSON but regularly wrap it in markdown fences or
//! surround it with a sentence of prose. Everything they return is treated as
//! untrusted text and goes through [`parse_model_output`], which either yields
//! structured data or a tagged parse failure.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Result of normalizing one model response
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedOutput {
    /// A JSON object or array
    Structured(Value),
    /// Nothing structured could be recovered
    Unparsable { reason: String },
}

static RE_FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)\r?\n?```").unwrap());

/// Parse raw model text, trying progressively looser strategies.
///
/// Order: the text as-is, the first fenced code block, then the widest
/// `{...}` or `[...]` span. Only objects and arrays count as structured.
pub fn parse_model_output(raw: &str) -> ParsedOutput {
    let text = strip_invisible(raw);
    let text = text.trim();

    if text.is_empty() {
        return ParsedOutput::Unparsable {
            reason: "model returned an empty response".to_string(),
        };
    }

    let mut last_error = None;

    for candidate in candidates(text) {
        match serde_json::from_str::<Value>(candidate) {
            Ok(value @ (Value::Object(_) | Value::Array(_))) => {
                return ParsedOutput::Structured(value)
            }
            Ok(other) => {
                last_error = Some(format!("expected a JSON object, got {}", type_name(&other)));
            }
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    ParsedOutput::Unparsable {
        reason: last_error.unwrap_or_else(|| "no JSON found in response".to_string()),
    }
}

fn candidates(text: &str) -> Vec<&str> {
    let mut out = vec![text];

    if let Some(caps) = RE_FENCED_BLOCK.captures(text) {
        if let Some(inner) = caps.get(1) {
            out.push(inner.as_str().trim());
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
            if start < end {
                out.push(&text[start..=end]);
            }
        }
    }

    out
}

fn strip_invisible(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\u{FEFF}' | '\u{200B}' | '\u{200C}' | '\u{200D}'))
        .collect()
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_json_object() {
        let parsed = parse_model_output(r#"{"merchant": "Nick the Greek"}"#);
        assert_eq!(
            parsed,
            ParsedOutput::Structured(json!({"merchant": "Nick the Greek"}))
        );
    }

    #[test]
    fn fenced_json_block() {
        let raw = "```json\n{\"total\": 42.5}\n```";
        assert_eq!(
            parse_model_output(raw),
            ParsedOutput::Structured(json!({"total": 42.5}))
        );
    }

    #[test]
    fn fence_without_language_tag() {
        let raw = "```\n[1, 2]\n```\n";
        assert_eq!(parse_model_output(raw), ParsedOutput::Structured(json!([1, 2])));
    }

    #[test]
    fn prose_around_object() {
        let raw = "Here is the data you asked for:\n{\"a\": {\"b\": 1}}\nLet me know!";
        assert_eq!(
            parse_model_output(raw),
            ParsedOutput::Structured(json!({"a": {"b": 1}}))
        );
    }

    #[test]
    fn byte_order_mark_ignored() {
        let raw = "\u{FEFF}{\"x\": true}";
        assert_eq!(
            parse_model_output(raw),
            ParsedOutput::Structured(json!({"x": true}))
        );
    }

    #[test]
    fn empty_response_unparsable() {
        assert!(matches!(
            parse_model_output("   \n"),
            ParsedOutput::Unparsable { .. }
        ));
    }

    #[test]
    fn plain_prose_unparsable() {
        assert!(matches!(
            parse_model_output("I could not read this document."),
            ParsedOutput::Unparsable { .. }
        ));
    }

    #[test]
    fn bare_scalar_unparsable() {
        match parse_model_output("42") {
            ParsedOutput::Unparsable { reason } => assert!(reason.contains("number")),
            other => panic!("expected unparsable, got {:?}", other),
        }
    }

    #[test]
    fn truncated_object_unparsable() {
        assert!(matches!(
            parse_model_output(r#"{"items": [1, 2"#),
            ParsedOutput::Unparsable { .. }
        ));
    }

    #[test]
    fn same_input_parses_identically() {
        let raw = "```json\n{\"restaurant\": \"Nick the Greek\", \"amount_due\": 42.50}\n```";
        let first = parse_model_output(raw);
        for _ in 0..5 {
            assert_eq!(parse_model_output(raw), first);
        }
    }
}
