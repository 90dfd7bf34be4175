use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::error::{Error, Result};

/// Finds document references (ids, URLs, file names) in free text.
///
/// Implementations must be idempotent: extracting from the joined output of
/// a previous extraction yields the same list.
pub trait ReferenceExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Vec<String>;
}

pub type Standardizer = fn(&str) -> String;

/// Regex-driven extractor. Matches are ordered by their first position in
/// the text across all patterns, standardized, then de-duplicated.
pub struct RegexReferenceExtractor {
    patterns: Vec<Regex>,
    standardize: Standardizer,
}

impl RegexReferenceExtractor {
    pub fn new(patterns: &[impl AsRef<str>]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            patterns,
            standardize: |s| s.trim().to_string(),
        })
    }

    #[must_use]
    pub fn with_standardizer(mut self, standardize: Standardizer) -> Self {
        self.standardize = standardize;
        self
    }
}

impl fmt::Debug for RegexReferenceExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegexReferenceExtractor")
            .field(
                "patterns",
                &self.patterns.iter().map(Regex::as_str).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl ReferenceExtractor for RegexReferenceExtractor {
    fn extract(&self, text: &str) -> Vec<String> {
        let mut matches: Vec<(usize, usize, &str)> = self
            .patterns
            .iter()
            .enumerate()
            .flat_map(|(i, re)| re.find_iter(text).map(move |m| (m.start(), i, m.as_str())))
            .collect();
        matches.sort_by_key(|(start, pattern, _)| (*start, *pattern));

        let mut seen = HashSet::new();
        matches
            .into_iter()
            .map(|(_, _, m)| (self.standardize)(m))
            .filter(|r| !r.is_empty() && seen.insert(r.clone()))
            .collect()
    }
}

/// Named extractors. Populated at startup, read-only afterwards.
#[derive(Clone, Default)]
pub struct ReferenceExtractorRegistry {
    extractors: BTreeMap<String, Arc<dyn ReferenceExtractor>>,
}

impl ReferenceExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name`, returning the extractor it replaced.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        extractor: Arc<dyn ReferenceExtractor>,
    ) -> Option<Arc<dyn ReferenceExtractor>> {
        let name = name.into();
        let previous = self.extractors.insert(name.clone(), extractor);
        if previous.is_some() {
            tracing::debug!(name = %name, "Replaced reference extractor");
        }
        previous
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ReferenceExtractor>> {
        self.extractors
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownReferenceExtractor(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.extractors.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for ReferenceExtractorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceExtractorRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    impl ReferenceExtractor for Fixed {
        fn extract(&self, _text: &str) -> Vec<String> {
            vec![self.0.to_string()]
        }
    }

    fn extractor() -> RegexReferenceExtractor {
        RegexReferenceExtractor::new(&[r"SOP-\d+", r"https?://\S+"])
            .unwrap()
            .with_standardizer(|s| s.trim_end_matches(['.', ',', ';']).to_string())
    }

    #[test]
    fn test_first_occurrence_order_across_patterns() {
        let text = "See https://a.example/x, then SOP-12 and SOP-3; SOP-12 again.";
        assert_eq!(
            extractor().extract(text),
            vec!["https://a.example/x", "SOP-12", "SOP-3"]
        );
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let e = extractor();
        let first = e.extract("SOP-9 cites SOP-1 and http://x.io/doc. Also SOP-9.");
        let second = e.extract(&first.join("\n"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_matches() {
        assert!(extractor().extract("nothing here").is_empty());
    }

    #[test]
    fn test_register_overwrites_and_returns_previous() {
        let mut registry = ReferenceExtractorRegistry::new();
        assert!(registry.register("refs_a", Arc::new(Fixed("one"))).is_none());

        let previous = registry.register("refs_a", Arc::new(Fixed("two"))).unwrap();
        assert_eq!(previous.extract(""), vec!["one"]);
        assert_eq!(registry.get("refs_a").unwrap().extract(""), vec!["two"]);
        assert_eq!(registry.names(), vec!["refs_a"]);
    }

    #[test]
    fn test_unknown_name() {
        let err = ReferenceExtractorRegistry::new().get("missing").err().unwrap();
        assert!(matches!(err, Error::UnknownReferenceExtractor(name) if name == "missing"));
    }
}
