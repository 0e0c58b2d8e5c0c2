//! Repair parser for structured model output.
//!
//! Generation models are asked for a JSON array but routinely wrap it in
//! markdown fences, leave trailing commas, or truncate mid-object. The
//! parser tries a direct parse first, then a bounded syntactic repair, and
//! reports which path produced the value. The raw payload is preserved on
//! failure so callers can persist it for forensics.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Three-way result of parsing untrusted model output.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    /// Parsed as-is (fence stripping aside).
    Clean(T),
    /// Parsed only after syntactic repair.
    Repaired(T),
    /// Unparseable even after repair. Carries the original parse error and
    /// the untouched raw text.
    Failed { error: String, raw: String },
}

impl<T> ParseOutcome<T> {
    pub fn is_failed(&self) -> bool {
        matches!(self, ParseOutcome::Failed { .. })
    }
}

/// Parse raw model output into an array of JSON values.
///
/// A bare array is accepted directly; an object is accepted when one of
/// `wrapper_keys` holds the array (models often wrap the payload, e.g.
/// `{"scenes": [...]}`).
pub fn parse_array(raw: &str, wrapper_keys: &[&str]) -> ParseOutcome<Vec<Value>> {
    let cleaned = strip_code_fences(raw);

    let direct_error = match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) => {
            return match normalize_to_array(value, wrapper_keys) {
                Some(items) => ParseOutcome::Clean(items),
                None => ParseOutcome::Failed {
                    error: "parsed value is neither an array nor a known wrapper object"
                        .to_string(),
                    raw: raw.to_string(),
                },
            };
        }
        Err(e) => e.to_string(),
    };

    let repaired = repair_json(&cleaned);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => match normalize_to_array(value, wrapper_keys) {
            Some(items) => ParseOutcome::Repaired(items),
            None => ParseOutcome::Failed {
                error: direct_error,
                raw: raw.to_string(),
            },
        },
        Err(_) => ParseOutcome::Failed {
            error: direct_error,
            raw: raw.to_string(),
        },
    }
}

/// Typed variant of [`parse_array`].
pub fn parse_array_of<T: DeserializeOwned>(
    raw: &str,
    wrapper_keys: &[&str],
) -> ParseOutcome<Vec<T>> {
    let (items, repaired) = match parse_array(raw, wrapper_keys) {
        ParseOutcome::Clean(items) => (items, false),
        ParseOutcome::Repaired(items) => (items, true),
        ParseOutcome::Failed { error, raw } => return ParseOutcome::Failed { error, raw },
    };

    let mut typed = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<T>(item) {
            Ok(value) => typed.push(value),
            Err(e) => {
                return ParseOutcome::Failed {
                    error: format!("array element did not match expected shape: {e}"),
                    raw: raw.to_string(),
                };
            }
        }
    }

    if repaired {
        ParseOutcome::Repaired(typed)
    } else {
        ParseOutcome::Clean(typed)
    }
}

/// Drop any line that is a markdown code-fence marker.
pub fn strip_code_fences(raw: &str) -> String {
    raw.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Bounded syntactic repair: comment-only lines out, trailing commas out,
/// then close whatever the scan finds open (string first, then braces
/// before brackets), and sweep trailing commas once more since closing can
/// expose new ones.
pub fn repair_json(text: &str) -> String {
    let without_comments = remove_comment_lines(text);
    let without_commas = strip_trailing_commas(&without_comments);
    let closed = close_open_structures(&without_commas);
    strip_trailing_commas(&closed)
}

fn remove_comment_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("//"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove commas that directly precede a closing brace or bracket,
/// honoring string literals so commas inside values survive.
fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if matches!(next, Some('}') | Some(']')) {
                    continue;
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    out
}

/// Character scan tracking string state (escape-aware) and signed depth
/// counters for braces and brackets; appends whatever closers the text
/// still owes.
fn close_open_structures(text: &str) -> String {
    let mut in_string = false;
    let mut escaped = false;
    let mut open_braces: i32 = 0;
    let mut open_brackets: i32 = 0;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => open_braces += 1,
            '}' => open_braces -= 1,
            '[' => open_brackets += 1,
            ']' => open_brackets -= 1,
            _ => {}
        }
    }

    let mut out = text.to_string();
    if in_string {
        out.push('"');
    }
    for _ in 0..open_braces.max(0) {
        out.push('}');
    }
    for _ in 0..open_brackets.max(0) {
        out.push(']');
    }
    out
}

fn normalize_to_array(value: Value, wrapper_keys: &[&str]) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => {
            for key in wrapper_keys {
                if let Some(Value::Array(items)) = map.remove(*key) {
                    return Some(items);
                }
            }
            None
        }
        _ => None,
    }
}
