use serde_json::Value;
use thiserror::Error;

use super::schema::{ExtractionSchema, ParsedRecord};

/// Why a raw model response could not become a record. Recoverable: the
/// caller retries or falls back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("no JSON object found in response")]
    NoJsonObject,
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("top-level JSON value is not an object")]
    NotAnObject,
    #[error("response does not match schema '{schema}': {}", .violations.join("; "))]
    SchemaViolation {
        schema: String,
        violations: Vec<String>,
    },
}

/// Parses untrusted model text into a record of `schema`.
///
/// Code fences and prose around the object are tolerated. If strict JSON
/// parsing fails the text is repaired (trailing commas, single quotes,
/// Python literals) and parsed once more. Validation is always strict.
pub fn parse(raw: &str, schema: &ExtractionSchema) -> Result<ParsedRecord, ParseFailure> {
    let value = parse_value(raw)?;

    let Value::Object(object) = value else {
        return Err(ParseFailure::NotAnObject);
    };

    let fields = schema
        .validate(&object)
        .map_err(|violations| ParseFailure::SchemaViolation {
            schema: schema.name.clone(),
            violations,
        })?;

    Ok(ParsedRecord {
        schema: schema.name.clone(),
        fields,
    })
}

fn parse_value(raw: &str) -> Result<Value, ParseFailure> {
    let stripped = strip_fences(raw);
    if stripped.is_empty() {
        return Err(ParseFailure::NoJsonObject);
    }

    if let Ok(value) = serde_json::from_str::<Value>(stripped) {
        return Ok(value);
    }

    let Some(candidate) = locate_object(stripped) else {
        return match serde_json::from_str::<Value>(&repair(stripped)) {
            Ok(_) => Err(ParseFailure::NotAnObject),
            Err(_) => Err(ParseFailure::NoJsonObject),
        };
    };

    serde_json::from_str::<Value>(candidate)
        .or_else(|_| serde_json::from_str::<Value>(&repair(candidate)))
        .map_err(|e| ParseFailure::Malformed(e.to_string()))
}

fn strip_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = rest.split_once('\n').map_or("", |(_, body)| body);
    }
    if let Some(rest) = text.trim_end().strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// Slice from the first `{` to its matching `}`, honouring quoted strings.
/// An unterminated object runs to the end of the text.
fn locate_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '"' | '\'' => quote = Some(c),
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }

    Some(&text[start..])
}

fn repair(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '"' => {
                let end = string_end(&chars, i, '"');
                out.extend(&chars[i..end]);
                i = end;
            }
            '\'' => {
                let end = string_end(&chars, i, '\'');
                out.push('"');
                let mut j = i + 1;
                let close = if end > i + 1 && chars[end - 1] == '\'' { end - 1 } else { end };
                while j < close {
                    match chars[j] {
                        '\\' if chars.get(j + 1) == Some(&'\'') => {
                            out.push('\'');
                            j += 1;
                        }
                        '"' => out.push_str("\\\""),
                        c => out.push(c),
                    }
                    j += 1;
                }
                out.push('"');
                i = end;
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}' | ']') | None) {
                    out.push(',');
                }
                i += 1;
            }
            c if c.is_ascii_alphabetic() => {
                let end = chars[i..]
                    .iter()
                    .position(|c| !c.is_ascii_alphanumeric() && *c != '_')
                    .map_or(chars.len(), |p| i + p);
                let word: String = chars[i..end].iter().collect();
                out.push_str(match word.as_str() {
                    "None" => "null",
                    "True" => "true",
                    "False" => "false",
                    other => other,
                });
                i = end;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Index just past the closing quote of the string opening at `start`.
fn string_end(chars: &[char], start: usize, quote: char) -> usize {
    let mut escaped = false;
    for (offset, c) in chars[start + 1..].iter().enumerate() {
        if escaped {
            escaped = false;
        } else if *c == '\\' {
            escaped = true;
        } else if *c == quote {
            return start + offset + 2;
        }
    }
    chars.len()
}
