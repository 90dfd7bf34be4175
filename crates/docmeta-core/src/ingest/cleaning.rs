use std::collections::{BTreeMap, HashMap};
use std::fmt;

use regex::Regex;

use super::chunker::Chunk;
use crate::error::Result;

/// A pure text transformation. Steps hold no per-document state.
pub trait CleaningStep: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, text: &str) -> String;
}

/// Ordered composition of cleaning steps. An empty pipeline is the identity.
#[derive(Default)]
pub struct CleaningPipeline {
    steps: Vec<Box<dyn CleaningStep>>,
}

impl CleaningPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_step(mut self, step: Box<dyn CleaningStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn add_step(&mut self, step: Box<dyn CleaningStep>) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn clean(&self, text: &str) -> String {
        self.steps
            .iter()
            .fold(text.to_string(), |acc, step| step.apply(&acc))
    }

    /// Cleans each chunk independently; indices, locators and metadata are kept.
    pub fn clean_chunks(&self, chunks: &[Chunk]) -> Vec<Chunk> {
        chunks
            .iter()
            .map(|chunk| chunk.with_text(self.clean(&chunk.text)))
            .collect()
    }
}

impl fmt::Debug for CleaningPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleaningPipeline")
            .field("steps", &self.step_names())
            .finish()
    }
}

/// Deletes every match of a set of patterns. `.` matches newlines.
pub struct PatternRemover {
    name: String,
    patterns: Vec<Regex>,
}

impl PatternRemover {
    pub fn new(name: impl Into<String>, patterns: &[impl AsRef<str>]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(&format!("(?s){}", p.as_ref())))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            name: name.into(),
            patterns,
        })
    }
}

impl CleaningStep for PatternRemover {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, text: &str) -> String {
        self.patterns.iter().fold(text.to_string(), |acc, re| {
            re.replace_all(&acc, "").into_owned()
        })
    }
}

/// Replaces document-intelligence checkbox tags with their glyphs.
pub struct SelectionTagReplacer {
    mappings: Vec<(String, String)>,
}

impl SelectionTagReplacer {
    #[must_use]
    pub fn new(mappings: &BTreeMap<String, String>) -> Self {
        let mut mappings: Vec<(String, String)> = mappings
            .iter()
            .filter(|(k, _)| !k.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        mappings.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { mappings }
    }
}

impl CleaningStep for SelectionTagReplacer {
    fn name(&self) -> &str {
        "selection_tags"
    }

    fn apply(&self, text: &str) -> String {
        self.mappings
            .iter()
            .fold(text.to_string(), |acc, (tag, glyph)| acc.replace(tag.as_str(), glyph))
    }
}

/// Collapses any run of whitespace containing three or more line breaks
/// into a single blank line.
pub struct ExcessBreakLineRemover {
    runs: Regex,
}

impl ExcessBreakLineRemover {
    pub fn new() -> Result<Self> {
        Ok(Self {
            runs: Regex::new(r"\n(?:\s*\n){2,}\s*")?,
        })
    }
}

impl CleaningStep for ExcessBreakLineRemover {
    fn name(&self) -> &str {
        "excess_line_breaks"
    }

    fn apply(&self, text: &str) -> String {
        self.runs.replace_all(text, "\n\n").into_owned()
    }
}

/// Trims trailing spaces and collapses runs of spaces and tabs inside lines.
pub struct WhitespaceNormalizer;

impl CleaningStep for WhitespaceNormalizer {
    fn name(&self) -> &str {
        "whitespace"
    }

    fn apply(&self, text: &str) -> String {
        text.split('\n')
            .map(|line| {
                let mut out = String::with_capacity(line.len());
                let mut in_gap = false;
                for c in line.trim_end().chars() {
                    if c == ' ' || c == '\t' {
                        in_gap = true;
                        continue;
                    }
                    if in_gap && !out.is_empty() {
                        out.push(' ');
                    }
                    in_gap = false;
                    out.push(c);
                }
                let indent = line.len() - line.trim_start_matches([' ', '\t']).len();
                if indent > 0 && !out.is_empty() {
                    format!("{}{out}", &line[..indent])
                } else {
                    out
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Converts embedded HTML into markdown-flavoured plain text: headings
/// become `#` lines, list items become `- ` lines, block elements break
/// lines and all other tags are dropped. `<script>` and `<style>` bodies
/// are removed with their tags.
pub struct MarkupStripper;

impl MarkupStripper {
    /// Lowercased element name and whether the tag closes it.
    fn tag_name(tag: &str) -> (String, bool) {
        let inner = tag.trim_start_matches('<').trim_end_matches('>').trim();
        let closing = inner.starts_with('/');
        let name = inner
            .trim_start_matches('/')
            .chars()
            .take_while(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_ascii_lowercase();
        (name, closing)
    }

    fn tag_replacement(name: &str, closing: bool) -> Option<&'static str> {
        match (name, closing) {
            ("h1", false) => Some("\n# "),
            ("h2", false) => Some("\n## "),
            ("h3", false) => Some("\n### "),
            ("h4", false) => Some("\n#### "),
            ("h5", false) => Some("\n##### "),
            ("h6", false) => Some("\n###### "),
            ("li", false) => Some("\n- "),
            ("br", _) | ("tr", true) => Some("\n"),
            ("td" | "th", true) => Some(" | "),
            ("p" | "div" | "ul" | "ol" | "table" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6", _) => {
                Some("\n\n")
            }
            _ => None,
        }
    }

    /// Text after the element's closing tag, or nothing if it never closes.
    fn skip_element<'a>(rest: &'a str, name: &str) -> &'a str {
        let closing = format!("</{name}");
        rest.to_ascii_lowercase()
            .find(&closing)
            .and_then(|at| rest[at..].find('>').map(|end| &rest[at + end + 1..]))
            .unwrap_or("")
    }
}

impl CleaningStep for MarkupStripper {
    fn name(&self) -> &str {
        "markup"
    }

    fn apply(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(open) = rest.find('<') {
            out.push_str(&rest[..open]);
            let candidate = &rest[open..];
            let is_tag = candidate[1..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '/' || c == '!');

            match candidate.find('>').filter(|_| is_tag) {
                Some(close) => {
                    let tag = &candidate[..=close];
                    let (name, closing) = Self::tag_name(tag);
                    rest = &candidate[close + 1..];

                    if !closing && !tag.ends_with("/>") && matches!(name.as_str(), "script" | "style") {
                        rest = Self::skip_element(rest, &name);
                    } else if let Some(replacement) = Self::tag_replacement(&name, closing) {
                        out.push_str(replacement);
                    }
                }
                None => {
                    out.push('<');
                    rest = &candidate[1..];
                }
            }
        }
        out.push_str(rest);

        decode_entities(&out)
    }
}

/// Decodes named and numeric character references in one pass, so `&amp;lt;`
/// becomes `&lt;` rather than `<`. Unknown references are kept verbatim.
fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let candidate = &rest[amp..];

        let decoded = candidate
            .get(1..candidate.len().min(12))
            .and_then(|window| window.find(';'))
            .and_then(|semi| decode_entity(&candidate[1..=semi]).map(|c| (c, semi + 2)));

        match decoded {
            Some((c, consumed)) => {
                out.push(c);
                rest = &candidate[consumed..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    let code = match entity {
        "nbsp" => return Some(' '),
        "lt" => return Some('<'),
        "gt" => return Some('>'),
        "quot" => return Some('"'),
        "apos" => return Some('\''),
        "amp" => return Some('&'),
        _ => entity.strip_prefix('#')?,
    };

    let value = match code.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => code.parse().ok()?,
    };
    char::from_u32(value)
}

/// Drops lines that repeat so often they are almost certainly running
/// headers or footers. Short lines are never considered.
pub struct FrequentLineRemover {
    length_threshold: usize,
    frequency_threshold: usize,
}

impl FrequentLineRemover {
    #[must_use]
    pub const fn new(length_threshold: usize, frequency_threshold: usize) -> Self {
        Self {
            length_threshold,
            frequency_threshold,
        }
    }
}

impl CleaningStep for FrequentLineRemover {
    fn name(&self) -> &str {
        "frequent_lines"
    }

    fn apply(&self, text: &str) -> String {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.chars().count() >= self.length_threshold {
                *counts.entry(line).or_default() += 1;
            }
        }

        let frequent: Vec<&str> = counts
            .into_iter()
            .filter(|(_, n)| *n >= self.frequency_threshold)
            .map(|(line, _)| line)
            .collect();

        if frequent.is_empty() {
            return text.to_string();
        }

        text.split_inclusive('\n')
            .filter(|line| !frequent.contains(&line.trim()))
            .collect()
    }
}

/// Wraps a plain function as a step.
pub struct FnStep {
    name: String,
    f: fn(&str) -> String,
}

impl FnStep {
    #[must_use]
    pub fn new(name: impl Into<String>, f: fn(&str) -> String) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl CleaningStep for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, text: &str) -> String {
        (self.f)(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SourceLocator;
    use proptest::prelude::*;

    #[test]
    fn test_pattern_remover_spans_lines() {
        let step = PatternRemover::new("figures", &[r"<figure>.*?</figure>"]).unwrap();
        let out = step.apply("before<figure>a\nb</figure>after");
        assert_eq!(out, "beforeafter");
    }

    #[test]
    fn test_pattern_remover_rejects_bad_regex() {
        assert!(PatternRemover::new("bad", &["("]).is_err());
    }

    #[test]
    fn test_selection_tags() {
        let mappings = BTreeMap::from([
            (":selected:".to_string(), "☒".to_string()),
            (":unselected:".to_string(), "☐".to_string()),
        ]);
        let step = SelectionTagReplacer::new(&mappings);
        assert_eq!(step.apply(":selected: yes :unselected: no"), "☒ yes ☐ no");
    }

    #[test]
    fn test_excess_breaks() {
        let step = ExcessBreakLineRemover::new().unwrap();
        assert_eq!(step.apply("a\n\n\n\nb"), "a\n\nb");
        assert_eq!(step.apply("a\n \n\t\n  b"), "a\n\nb");
        assert_eq!(step.apply("a\n\nb"), "a\n\nb");
        assert_eq!(step.apply("a  \n\n\nb"), "a  \n\nb");
    }

    #[test]
    fn test_whitespace_normalizer() {
        let step = WhitespaceNormalizer;
        assert_eq!(step.apply("a   b\t\tc  \n  d  e"), "a b c\n  d e");
    }

    #[test]
    fn test_markup_stripper() {
        let step = MarkupStripper;
        let out = step.apply("<h1>Title</h1><p>Body &amp; more</p><ul><li>one</li></ul>");
        assert!(out.contains("# Title"));
        assert!(out.contains("Body & more"));
        assert!(out.contains("- one"));
        assert!(!out.contains('<'));
    }

    #[test]
    fn test_markup_stripper_drops_script_and_style() {
        let out = MarkupStripper.apply(
            "<style>p { color: red; }</style><p>Kept</p><SCRIPT type=\"x\">alert(1)</SCRIPT>tail",
        );
        assert!(out.contains("Kept"));
        assert!(out.ends_with("tail"));
        assert!(!out.contains("color"));
        assert!(!out.contains("alert"));
    }

    #[test]
    fn test_entities_decoded_once() {
        assert_eq!(
            MarkupStripper.apply("it&#8217;s &#x2019; &apos;q&apos; &amp;lt; &bogus; a & b"),
            "it\u{2019}s \u{2019} 'q' &lt; &bogus; a & b"
        );
    }

    #[test]
    fn test_markup_stripper_keeps_comparisons() {
        assert_eq!(MarkupStripper.apply("a < b and c > d"), "a < b and c > d");
    }

    #[test]
    fn test_frequent_line_remover() {
        let footer = "Confidential - Company Internal";
        let text = format!("{footer}\nintro\n{footer}\nbody\n{footer}\n");
        let step = FrequentLineRemover::new(10, 3);

        assert_eq!(step.apply(&text), "intro\nbody\n");
        assert_eq!(FrequentLineRemover::new(10, 4).apply(&text), text);
    }

    #[test]
    fn test_pipeline_runs_in_order() {
        let pipeline = CleaningPipeline::new()
            .with_step(Box::new(FnStep::new("upper", |s| s.to_uppercase())))
            .with_step(Box::new(FnStep::new("suffix", |s| format!("{s}!"))));

        assert_eq!(pipeline.step_names(), vec!["upper", "suffix"]);
        assert_eq!(pipeline.clean("hi"), "HI!");
    }

    #[test]
    fn test_clean_chunks_preserves_position() {
        let pipeline =
            CleaningPipeline::new().with_step(Box::new(FnStep::new("trim", |s| s.trim().into())));
        let chunks = vec![
            Chunk::new(0, " a ", SourceLocator::Whole),
            Chunk::new(1, " b ", SourceLocator::Page { number: 2 }).with_metadata("k", "v"),
        ];

        let cleaned = pipeline.clean_chunks(&chunks);

        assert_eq!(cleaned[1].index, 1);
        assert_eq!(cleaned[1].text, "b");
        assert_eq!(cleaned[1].locator, SourceLocator::Page { number: 2 });
        assert_eq!(cleaned[1].metadata.get("k").map(String::as_str), Some("v"));
    }

    proptest! {
        #[test]
        fn empty_pipeline_is_identity(text in "\\PC*") {
            prop_assert_eq!(CleaningPipeline::new().clean(&text), text);
        }
    }
}
