//! Model-free recovery for documents where every extraction pass came back
//! empty.

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::ingest::Document;

pub trait FallbackExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Field names [`extract`](Self::extract) may fill.
    fn provided_fields(&self) -> Vec<String>;

    /// `cleaned` is the text the passes saw; `document.text` still carries
    /// running headers and footers. `None` when nothing was recovered.
    fn extract(&self, document: &Document, cleaned: &str) -> Option<Map<String, Value>>;
}

struct FieldPattern {
    field: String,
    pattern: Regex,
    margin_only: bool,
}

/// Fills each field from the first capture group of its pattern. The first
/// pattern to match a field wins.
///
/// Margin patterns only see the first and last non-blank lines of the raw
/// text, where running headers and footers sit; cleaning usually strips
/// those lines before the passes run.
pub struct PatternFallback {
    name: String,
    patterns: Vec<FieldPattern>,
    margin_lines: usize,
}

impl PatternFallback {
    pub const DEFAULT_MARGIN_LINES: usize = 5;

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            patterns: Vec::new(),
            margin_lines: Self::DEFAULT_MARGIN_LINES,
        }
    }

    /// Matched against the cleaned text.
    pub fn field(self, field: &str, pattern: &str) -> Result<Self> {
        self.push(field, pattern, false)
    }

    /// Matched against the raw header and footer lines only.
    pub fn margin_field(self, field: &str, pattern: &str) -> Result<Self> {
        self.push(field, pattern, true)
    }

    #[must_use]
    pub fn with_margin_lines(mut self, margin_lines: usize) -> Self {
        self.margin_lines = margin_lines.max(1);
        self
    }

    fn push(mut self, field: &str, pattern: &str, margin_only: bool) -> Result<Self> {
        let pattern = Regex::new(pattern)?;
        if pattern.captures_len() < 2 {
            return Err(Error::Config(format!(
                "fallback pattern for '{field}' has no capture group"
            )));
        }
        self.patterns.push(FieldPattern {
            field: field.to_string(),
            pattern,
            margin_only,
        });
        Ok(self)
    }

    fn margins(&self, text: &str) -> String {
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() <= 2 * self.margin_lines {
            return lines.join("\n");
        }
        let head = &lines[..self.margin_lines];
        let tail = &lines[lines.len() - self.margin_lines..];
        head.iter().chain(tail).copied().collect::<Vec<_>>().join("\n")
    }
}

impl FallbackExtractor for PatternFallback {
    fn name(&self) -> &str {
        &self.name
    }

    fn provided_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.patterns.iter().map(|p| p.field.clone()).collect();
        fields.dedup();
        fields
    }

    fn extract(&self, document: &Document, cleaned: &str) -> Option<Map<String, Value>> {
        let margins = self.margins(&document.text);
        let mut fields = Map::new();

        for candidate in &self.patterns {
            if fields.contains_key(&candidate.field) {
                continue;
            }
            let haystack = if candidate.margin_only {
                margins.as_str()
            } else {
                cleaned
            };
            let value = candidate
                .pattern
                .captures(haystack)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim())
                .filter(|v| !v.is_empty());

            if let Some(value) = value {
                fields.insert(candidate.field.clone(), Value::String(value.to_string()));
            }
        }

        (!fields.is_empty()).then_some(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::DocumentFormat;

    fn document(text: &str) -> Document {
        Document::new(DocumentFormat::PlainText, text.to_string())
    }

    #[test]
    fn test_pattern_without_group_rejected() {
        assert!(PatternFallback::new("f").field("title", r"Title:.*").is_err());
        assert!(PatternFallback::new("f").field("title", r"(unclosed").is_err());
    }

    #[test]
    fn test_first_matching_pattern_wins() {
        let fallback = PatternFallback::new("f")
            .field("title", r"(?m)^Title:\s*(.+)$")
            .unwrap()
            .field("title", r"(?m)^#\s*(.+)$")
            .unwrap();
        let text = "# Heading\nTitle: Labeled";

        let fields = fallback.extract(&document(text), text).unwrap();

        assert_eq!(fields["title"], "Labeled");
        assert_eq!(fallback.provided_fields(), vec!["title"]);
    }

    #[test]
    fn test_margin_patterns_ignore_body() {
        let fallback = PatternFallback::new("f")
            .margin_field("name", r"Doc No\.\s*:\s*(\S+)")
            .unwrap()
            .with_margin_lines(1);
        let body = "Header\nline\nDoc No. : SOP-9\nline\nFooter";

        assert!(fallback.extract(&document(body), body).is_none());

        let stamped = "Doc No. : SOP-1\nline\nline\nline\nFooter";
        let fields = fallback.extract(&document(stamped), "line").unwrap();
        assert_eq!(fields["name"], "SOP-1");
    }
}
