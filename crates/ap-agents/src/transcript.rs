//! Helpers for turning raw engine payloads into transcript text.

use serde_json::Value;

/// Substrings that mark a tool result as an error. Observability only: an
/// error-looking result never fails the task by itself.
const ERROR_MARKERS: &[&str] = &[
    "error:",
    "exception",
    "traceback (most recent call last)",
    "permission denied",
    "command not found",
    "no such file or directory",
    "exit code 1",
    "<tool_use_error>",
];

/// Render a tool-result payload as text, whatever its JSON shape.
///
/// Strings pass through. A list of `{"type":"text","text":..}` blocks is
/// joined by newlines. Absent or `null` becomes `"null"`. Anything else is
/// JSON-serialized so nested data stays readable.
pub fn normalize_tool_content(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) if !items.is_empty() => match text_blocks(items) {
            Some(joined) => joined,
            None => serialize(content),
        },
        Some(_) => serialize(content),
    }
}

fn text_blocks(items: &[Value]) -> Option<String> {
    let texts: Option<Vec<&str>> = items
        .iter()
        .map(|item| {
            if item.get("type").and_then(Value::as_str) == Some("text") {
                item.get("text").and_then(Value::as_str)
            } else {
                None
            }
        })
        .collect();
    texts.map(|t| t.join("\n"))
}

fn serialize(content: Option<&Value>) -> String {
    content
        .and_then(|v| serde_json::to_string(v).ok())
        .unwrap_or_else(|| "null".to_string())
}

/// Whether normalized tool output looks like an error.
pub fn looks_like_error(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    ERROR_MARKERS.iter().any(|m| lower.contains(m))
}

/// Cut `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_summary(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_every_shape_to_non_empty_text() {
        let cases = [
            (None, "null".to_string()),
            (Some(json!(null)), "null".to_string()),
            (Some(json!(42)), "42".to_string()),
            (Some(json!(true)), "true".to_string()),
            (Some(json!("plain")), "plain".to_string()),
            (
                Some(json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}])),
                "a\nb".to_string(),
            ),
            (Some(json!([1, 2])), "[1,2]".to_string()),
            (
                Some(json!({"files": [{"path": "a.rs"}]})),
                r#"{"files":[{"path":"a.rs"}]}"#.to_string(),
            ),
        ];
        for (input, expected) in cases {
            let got = normalize_tool_content(input.as_ref());
            assert!(!got.is_empty());
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn mixed_block_array_is_serialized() {
        let value = json!([{"type": "text", "text": "a"}, {"type": "image", "source": {}}]);
        let got = normalize_tool_content(Some(&value));
        assert!(got.starts_with('['));
        assert!(got.contains("image"));
    }

    #[test]
    fn empty_array_is_serialized() {
        assert_eq!(normalize_tool_content(Some(&json!([]))), "[]");
    }

    #[test]
    fn error_markers() {
        assert!(looks_like_error("Error: file not found"));
        assert!(looks_like_error("bash: foo: command not found"));
        assert!(!looks_like_error("All 12 tests passed"));
    }

    #[test]
    fn truncation() {
        assert_eq!(truncate_summary("  short  ", 10), "short");
        assert_eq!(truncate_summary("abcdefghij", 8), "abcde...");
        assert_eq!(truncate_summary("ééééé", 4), "é...");
    }
}
