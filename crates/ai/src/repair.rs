//! Deterministic cleanup for almost-JSON model output.
//!
//! Models occasionally wrap JSON in markdown fences, prepend prose, leave
//! trailing commas or drop closing brackets. The repair pass handles those
//! shapes; anything beyond them stays an error.

/// Attempts to turn `raw` into parseable JSON. Returns the repaired string
/// only if it actually parses.
pub fn repair_json(raw: &str) -> Option<String> {
    let mut candidate = strip_fences(raw.trim());
    candidate = slice_to_json_bounds(candidate);
    let mut text = remove_trailing_commas(candidate);
    close_open_brackets(&mut text);

    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(_) => Some(text),
        Err(_) => None,
    }
}

fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) up to the first newline.
    let rest = match rest.find('\n') {
        Some(index) => &rest[index + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Cuts leading prose before the first `{`/`[` and trailing prose after the
/// last `}`/`]`.
fn slice_to_json_bounds(raw: &str) -> &str {
    let start = raw.find(['{', '[']);
    let Some(start) = start else {
        return raw;
    };
    let end = raw.rfind(['}', ']']).map(|index| index + 1).unwrap_or(raw.len());
    if end > start {
        &raw[start..end]
    } else {
        &raw[start..]
    }
}

fn remove_trailing_commas(raw: &str) -> String {
    let mut output = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = raw.chars().collect();

    for (index, ch) in chars.iter().copied().enumerate() {
        if in_string {
            output.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                output.push(ch);
            }
            ',' => {
                let next = chars[index + 1..].iter().find(|next| !next.is_whitespace());
                if matches!(next, Some('}') | Some(']')) {
                    continue;
                }
                output.push(ch);
            }
            _ => output.push(ch),
        }
    }
    output
}

fn close_open_brackets(text: &mut String) {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    if in_string {
        text.push('"');
    }
    while let Some(closer) = stack.pop() {
        text.push(closer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_json_passes_through() {
        let repaired = repair_json(r#"{"a": 1}"#).expect("repair");
        assert_eq!(repaired, r#"{"a": 1}"#);
    }

    #[test]
    fn strips_markdown_fences() {
        let raw = "```json\n{\"semantic_relevance\": \"STRONG\"}\n```";
        let repaired = repair_json(raw).expect("repair");
        assert_eq!(repaired, r#"{"semantic_relevance": "STRONG"}"#);
    }

    #[test]
    fn cuts_surrounding_prose() {
        let raw = "好的，以下是结果：{\"a\": 1} 希望有帮助";
        assert_eq!(repair_json(raw).as_deref(), Some(r#"{"a": 1}"#));
    }

    #[test]
    fn removes_trailing_commas() {
        let raw = r#"{"a": 1, "b": [1, 2,],}"#;
        let repaired = repair_json(raw).expect("repair");
        assert_eq!(repaired, r#"{"a": 1, "b": [1, 2]}"#);
    }

    #[test]
    fn closes_missing_brackets() {
        let raw = r#"{"customer_refs": [{"customer_name": "阿里""#;
        let repaired = repair_json(raw).expect("repair");
        let value: serde_json::Value = serde_json::from_str(&repaired).expect("parse");
        assert_eq!(value["customer_refs"][0]["customer_name"], "阿里");
    }

    #[test]
    fn commas_inside_strings_survive() {
        let raw = r#"{"note": "先去A,再去B,"}"#;
        let repaired = repair_json(raw).expect("repair");
        assert_eq!(repaired, raw);
    }

    #[test]
    fn hopeless_input_stays_an_error() {
        assert!(repair_json("完全不是 JSON 的内容").is_none());
    }
}
