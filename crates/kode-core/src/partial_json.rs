//! Tolerant decoder for tool-call arguments that are still streaming in.
//!
//! [`extract`] returns the key/value pairs of an object literal whose values
//! are already syntactically complete. It is only used for live previews;
//! execution always re-parses the finished arguments strictly.
//!
//! Keys of a nested object value are reported as if they were top-level keys
//! and the nested object itself is not. Callers rendering previews rely on
//! seeing those inner fields early.

use serde_json::{Map, Value};

const PREVIEW_VALUE_CHARS: usize = 60;

/// Extract the complete top-level pairs from `text`. Never fails.
pub fn extract(text: &str) -> Map<String, Value> {
    let mut scanner = Scanner {
        bytes: text.as_bytes(),
        text,
        pos: 0,
    };
    let mut out = Map::new();

    scanner.skip_ws();
    if !scanner.eat(b'{') {
        return out;
    }
    let mut depth = 1usize;

    loop {
        scanner.skip_ws_and_commas();
        match scanner.peek() {
            None => break,
            Some(b'}') => {
                scanner.pos += 1;
                depth -= 1;
                if depth == 0 {
                    break;
                }
                continue;
            }
            Some(b'"') => {}
            Some(_) => break,
        }

        let Some(key) = scanner.string() else { break };
        scanner.skip_ws();
        if !scanner.eat(b':') {
            break;
        }
        scanner.skip_ws();

        match scanner.peek() {
            Some(b'{') => {
                scanner.pos += 1;
                depth += 1;
            }
            Some(b'"') => match scanner.string() {
                Some(value) => {
                    out.insert(key, Value::String(value));
                }
                None => break,
            },
            Some(b'[') => {
                if !scanner.skip_array() {
                    break;
                }
            }
            Some(b'-' | b'0'..=b'9') => match scanner.number() {
                Some(value) => {
                    out.insert(key, value);
                }
                None => break,
            },
            Some(b't' | b'f' | b'n') => match scanner.keyword() {
                Some(value) => {
                    out.insert(key, value);
                }
                None => break,
            },
            _ => break,
        }
    }

    out
}

/// One-line `key: value` preview of decoded arguments, or `None` if empty.
pub fn compact_params(args: &Map<String, Value>) -> Option<String> {
    if args.is_empty() {
        return None;
    }
    let parts: Vec<String> = args
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.replace('\n', " "),
                other => other.to_string(),
            };
            format!("{}: {}", key, truncate(&rendered, PREVIEW_VALUE_CHARS))
        })
        .collect();
    Some(parts.join(", "))
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

struct Scanner<'a> {
    bytes: &'a [u8],
    text: &'a str,
    pos: usize,
}

impl Scanner<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn skip_ws_and_commas(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r' | b',')) {
            self.pos += 1;
        }
    }

    /// Value must be followed by `,`, `}` or the end of input.
    fn at_delimiter(&mut self) -> bool {
        self.skip_ws();
        matches!(self.peek(), None | Some(b',') | Some(b'}'))
    }

    /// Byte index just past the closing quote of the string starting at `start`.
    fn string_end(&self, start: usize) -> Option<usize> {
        let mut i = start + 1;
        while i < self.bytes.len() {
            match self.bytes[i] {
                b'\\' => i += 2,
                b'"' => return Some(i + 1),
                _ => i += 1,
            }
        }
        None
    }

    fn string(&mut self) -> Option<String> {
        let end = self.string_end(self.pos)?;
        let decoded = serde_json::from_str::<String>(&self.text[self.pos..end]).ok()?;
        self.pos = end;
        Some(decoded)
    }

    fn number(&mut self) -> Option<Value> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E')
        ) {
            self.pos += 1;
        }
        let literal = &self.text[start..self.pos];
        if !self.at_delimiter() {
            return None;
        }
        let parsed: f64 = literal.parse().ok()?;
        if !parsed.is_finite() {
            return None;
        }
        serde_json::from_str::<Value>(literal).ok()
    }

    fn keyword(&mut self) -> Option<Value> {
        let rest = &self.bytes[self.pos..];
        let (len, value) = if rest.starts_with(b"true") {
            (4, Value::Bool(true))
        } else if rest.starts_with(b"false") {
            (5, Value::Bool(false))
        } else if rest.starts_with(b"null") {
            (4, Value::Null)
        } else {
            return None;
        };
        self.pos += len;
        if self.at_delimiter() {
            Some(value)
        } else {
            None
        }
    }

    /// Step over a closed array. Arrays are never reported.
    fn skip_array(&mut self) -> bool {
        let mut depth = 0usize;
        let mut i = self.pos;
        while i < self.bytes.len() {
            match self.bytes[i] {
                b'"' => match self.string_end(i) {
                    Some(end) => {
                        i = end;
                        continue;
                    }
                    None => return false,
                },
                b'[' | b'{' => depth += 1,
                b']' | b'}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        self.pos = i + 1;
                        return true;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trailing_number_at_end_of_input() {
        let out = extract(r#"{"name": "John", "age": 2"#);
        assert_eq!(Value::Object(out), json!({"name": "John", "age": 2}));
    }

    #[test]
    fn test_incomplete_keyword_excluded() {
        let out = extract(r#"{"complete": true, "incomplete": tru"#);
        assert_eq!(Value::Object(out), json!({"complete": true}));
    }

    #[test]
    fn test_empty_and_garbage_input() {
        assert!(extract("").is_empty());
        assert!(extract("   ").is_empty());
        assert!(extract("not json").is_empty());
        assert!(extract("[1, 2]").is_empty());
    }

    #[test]
    fn test_open_string_excluded() {
        let out = extract(r#"{"path": "src/main.rs", "content": "fn main() {"#);
        assert_eq!(Value::Object(out), json!({"path": "src/main.rs"}));
    }

    #[test]
    fn test_escaped_quotes_in_string() {
        let out = extract(r#"{"text": "say \"hi\"\n", "x": 1}"#);
        assert_eq!(out["text"], json!("say \"hi\"\n"));
        assert_eq!(out["x"], json!(1));
    }

    #[test]
    fn test_string_ending_in_escaped_quote_is_incomplete() {
        let out = extract(r#"{"text": "abc\""#);
        assert!(out.is_empty());
    }

    #[test]
    fn test_number_followed_by_delimiter() {
        let out = extract(r#"{"a": -1.5e2, "b": 3"#);
        assert_eq!(out["a"], json!(-150.0));
        assert_eq!(out["b"], json!(3));
    }

    #[test]
    fn test_malformed_number_excluded() {
        let out = extract(r#"{"a": 1-2, "b": true}"#);
        assert!(!out.contains_key("a"));
    }

    #[test]
    fn test_null_and_false() {
        let out = extract(r#"{"a": null, "b": false}"#);
        assert_eq!(Value::Object(out), json!({"a": null, "b": false}));
    }

    #[test]
    fn test_nested_object_keys_flattened() {
        let out = extract(r#"{"outer": {"inner": "x", "n": 1}, "after": true}"#);
        assert_eq!(
            Value::Object(out),
            json!({"inner": "x", "n": 1, "after": true})
        );
    }

    #[test]
    fn test_array_values_excluded() {
        let out = extract(r#"{"a": [1, 2], "b": "x""#);
        assert_eq!(Value::Object(out), json!({"b": "x"}));

        let out = extract(r#"{"paths": ["a", "b]"], "n": 3, "open": [1, 2"#);
        assert_eq!(Value::Object(out), json!({"n": 3}));
    }

    #[test]
    fn test_complete_object_matches_strict_parse() {
        let text = r#"{"command": "ls -la", "timeout": 30, "background": false}"#;
        let strict: Map<String, Value> = serde_json::from_str(text).unwrap();
        assert_eq!(extract(text), strict);
    }

    #[test]
    fn test_compact_params() {
        let out = extract(r#"{"path": "src/lib.rs", "line": 10}"#);
        let preview = compact_params(&out).unwrap();
        assert!(preview.contains("path: src/lib.rs"));
        assert!(preview.contains("line: 10"));
        assert!(compact_params(&Map::new()).is_none());
    }

    #[test]
    fn test_compact_params_truncates_long_values() {
        let long = "x".repeat(200);
        let mut args = Map::new();
        args.insert("content".to_string(), Value::String(long));
        let preview = compact_params(&args).unwrap();
        assert!(preview.ends_with("..."));
        assert!(preview.len() < 80);
    }
}
