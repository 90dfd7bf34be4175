use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::extract::{LlmPass, PerChunkResult};
use crate::references::{ReferenceExtractor, ReferenceExtractorRegistry};

/// One schema's fields merged across all units, with the chunk indices
/// each value came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergedRecord {
    pub schema: String,
    pub fields: Map<String, Value>,
    pub provenance: BTreeMap<String, Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub pass_name: String,
    pub chunk_index: usize,
    pub model_calls: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergedDocument {
    pub records: Vec<MergedRecord>,
    pub references: Vec<String>,
    pub failures: Vec<UnitFailure>,
}

impl MergedDocument {
    pub fn record(&self, schema: &str) -> Option<&MergedRecord> {
        self.records.iter().find(|r| r.schema == schema)
    }

    /// All fields in one map. A field name present in several schemas keeps
    /// the first non-empty value in pass declaration order.
    pub fn flatten(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for record in &self.records {
            for (name, value) in &record.fields {
                let replace = out
                    .get(name)
                    .map_or(true, |current| is_empty(current) && !is_empty(value));
                if replace {
                    out.insert(name.clone(), value.clone());
                }
            }
        }
        out
    }

    /// True when no pass produced a single non-empty field.
    pub fn has_no_fields(&self) -> bool {
        self.records
            .iter()
            .all(|r| r.fields.values().all(is_empty))
    }
}

/// Reduces per-unit results into one record per schema and scans the full
/// document text for references with the bound extractor.
pub struct PostProcessor {
    extractor_name: String,
    extractor: Arc<dyn ReferenceExtractor>,
    reference_fields: Vec<String>,
}

impl PostProcessor {
    /// Fails with `UnknownReferenceExtractor` when `extractor_name` is unbound.
    pub fn new(extractor_name: &str, registry: &ReferenceExtractorRegistry) -> Result<Self> {
        Ok(Self {
            extractor_name: extractor_name.to_string(),
            extractor: registry.get(extractor_name)?,
            reference_fields: Vec::new(),
        })
    }

    /// Fields whose values are re-normalized through the extractor after merging.
    #[must_use]
    pub fn with_reference_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reference_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn extractor_name(&self) -> &str {
        &self.extractor_name
    }

    pub fn reference_fields(&self) -> &[String] {
        &self.reference_fields
    }

    pub fn merge<'a>(
        &self,
        results: &[PerChunkResult],
        passes: impl IntoIterator<Item = &'a LlmPass>,
        full_text: &str,
    ) -> MergedDocument {
        let mut records: Vec<MergedRecord> = Vec::new();
        let mut schema_of: BTreeMap<&str, usize> = BTreeMap::new();

        for pass in passes {
            let schema = pass.output_schema.name.as_str();
            let slot = match records.iter().position(|r| r.schema == schema) {
                Some(i) => i,
                None => {
                    records.push(MergedRecord {
                        schema: schema.to_string(),
                        ..MergedRecord::default()
                    });
                    records.len() - 1
                }
            };
            schema_of.insert(pass.name.as_str(), slot);
        }

        let mut ordered: Vec<&PerChunkResult> = results.iter().collect();
        ordered.sort_by_key(|r| r.chunk_index);

        let mut failures = Vec::new();

        for result in ordered {
            let record = match &result.outcome {
                Ok(record) => record,
                Err(failed) => {
                    failures.push(UnitFailure {
                        pass_name: result.pass_name.clone(),
                        chunk_index: result.chunk_index,
                        model_calls: result.model_calls,
                        reason: failed.reason.to_string(),
                    });
                    continue;
                }
            };

            let Some(&slot) = schema_of.get(result.pass_name.as_str()) else {
                tracing::warn!(pass = %result.pass_name, "Result for undeclared pass ignored");
                continue;
            };

            for (name, value) in &record.fields {
                merge_field(&mut records[slot], name, value, result.chunk_index);
            }
        }

        for record in &mut records {
            self.normalize_reference_fields(record);
        }

        failures.sort_by(|a, b| (a.pass_name.as_str(), a.chunk_index).cmp(&(b.pass_name.as_str(), b.chunk_index)));

        let references = self.extractor.extract(full_text);
        tracing::debug!(
            extractor = %self.extractor_name,
            references = references.len(),
            failures = failures.len(),
            "Merged extraction results"
        );

        MergedDocument {
            records,
            references,
            failures,
        }
    }

    fn normalize_reference_fields(&self, record: &mut MergedRecord) {
        for field in &self.reference_fields {
            let Some(value) = record.fields.get_mut(field) else {
                continue;
            };

            let texts: Vec<&str> = match value {
                Value::String(s) => vec![s.as_str()],
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                _ => continue,
            };

            let mut normalized: Vec<String> = Vec::new();
            for text in texts {
                for reference in self.extractor.extract(text) {
                    if !normalized.contains(&reference) {
                        normalized.push(reference);
                    }
                }
            }

            *value = Value::Array(normalized.into_iter().map(Value::String).collect());
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Scalars: first non-empty value in chunk order wins, but an empty value is
/// kept when nothing better turns up. Lists: concatenated, de-duplicated.
fn merge_field(record: &mut MergedRecord, name: &str, value: &Value, chunk_index: usize) {
    let provenance = record.provenance.entry(name.to_string()).or_default();

    match (record.fields.get_mut(name), value) {
        (None, _) => {
            record.fields.insert(name.to_string(), value.clone());
            provenance.push(chunk_index);
        }
        (Some(Value::Array(existing)), Value::Array(incoming)) => {
            let mut contributed = false;
            for item in incoming {
                if !existing.contains(item) {
                    existing.push(item.clone());
                    contributed = true;
                }
            }
            if contributed && !provenance.contains(&chunk_index) {
                provenance.push(chunk_index);
            }
        }
        (Some(existing), incoming) => {
            if is_empty(existing) && !is_empty(incoming) {
                *existing = incoming.clone();
                provenance.clear();
                provenance.push(chunk_index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{
        ExtractionFailed, ExtractionSchema, FailureReason, ParseFailure, ParsedRecord, Tier,
        TierPolicy,
    };
    use crate::references::RegexReferenceExtractor;
    use serde_json::json;

    fn registry() -> ReferenceExtractorRegistry {
        let mut registry = ReferenceExtractorRegistry::new();
        registry.register(
            "ids",
            Arc::new(RegexReferenceExtractor::new(&[r"DOC-\d+"]).unwrap()),
        );
        registry
    }

    fn pass(name: &str, schema: &str) -> LlmPass {
        LlmPass::new(
            name,
            ExtractionSchema::new(schema),
            "",
            TierPolicy::new("small", 1).unwrap(),
        )
    }

    fn ok(pass: &str, chunk: usize, fields: Value) -> PerChunkResult {
        PerChunkResult {
            chunk_index: chunk,
            pass_name: pass.into(),
            model_calls: 1,
            tier: Tier::Fast,
            cached: false,
            outcome: Ok(ParsedRecord {
                schema: pass.into(),
                fields: fields.as_object().cloned().unwrap(),
            }),
        }
    }

    fn failed(pass: &str, chunk: usize) -> PerChunkResult {
        PerChunkResult {
            chunk_index: chunk,
            pass_name: pass.into(),
            model_calls: 3,
            tier: Tier::Fast,
            cached: false,
            outcome: Err(ExtractionFailed {
                tier: Tier::Fast,
                reason: FailureReason::Rejected(ParseFailure::NoJsonObject),
                last_response: None,
            }),
        }
    }

    #[test]
    fn test_unknown_extractor_fails_construction() {
        assert!(PostProcessor::new("nope", &registry()).is_err());
    }

    #[test]
    fn test_failed_chunk_contributes_nothing() {
        let processor = PostProcessor::new("ids", &registry()).unwrap();
        let passes = [pass("identity", "identity")];
        let results = vec![
            ok("identity", 0, json!({"title": "From one", "tags": ["a"]})),
            failed("identity", 1),
            ok("identity", 2, json!({"title": "From three", "owner": "QA", "tags": ["b", "a"]})),
        ];

        let merged = processor.merge(&results, &passes, "");
        let record = merged.record("identity").unwrap();

        assert_eq!(record.fields["title"], json!("From one"));
        assert_eq!(record.fields["owner"], json!("QA"));
        assert_eq!(record.fields["tags"], json!(["a", "b"]));
        assert_eq!(record.provenance["title"], vec![0]);
        assert_eq!(record.provenance["tags"], vec![0, 2]);
        assert!(record.provenance.values().all(|chunks| !chunks.contains(&1)));
        assert_eq!(merged.failures.len(), 1);
        assert_eq!(merged.failures[0].chunk_index, 1);
    }

    #[test]
    fn test_empty_value_kept_until_non_empty_found() {
        let processor = PostProcessor::new("ids", &registry()).unwrap();
        let passes = [pass("p", "s")];

        let results = vec![ok("p", 0, json!({"scope": ""})), ok("p", 1, json!({"scope": "Plant"}))];
        let merged = processor.merge(&results, &passes, "");
        assert_eq!(merged.record("s").unwrap().fields["scope"], json!("Plant"));
        assert_eq!(merged.record("s").unwrap().provenance["scope"], vec![1]);

        let results = vec![ok("p", 0, json!({"scope": ""}))];
        let merged = processor.merge(&results, &passes, "");
        assert_eq!(merged.record("s").unwrap().fields["scope"], json!(""));

        let merged = processor.merge(&[failed("p", 0)], &passes, "");
        assert!(!merged.record("s").unwrap().fields.contains_key("scope"));
    }

    #[test]
    fn test_references_from_full_text() {
        let processor = PostProcessor::new("ids", &registry()).unwrap();
        let merged = processor.merge(&[], &[pass("p", "s")], "see DOC-2, DOC-1 and DOC-2");
        assert_eq!(merged.references, vec!["DOC-2", "DOC-1"]);
    }

    #[test]
    fn test_reference_fields_are_normalized() {
        let processor = PostProcessor::new("ids", &registry())
            .unwrap()
            .with_reference_fields(["related", "governing"]);
        let passes = [pass("p", "s")];
        let results = vec![ok(
            "p",
            0,
            json!({"related": ["Policy DOC-7 rev 2", "no id here", "DOC-7"], "governing": "DOC-1 and DOC-3"}),
        )];

        let merged = processor.merge(&results, &passes, "");
        let fields = &merged.record("s").unwrap().fields;

        assert_eq!(fields["related"], json!(["DOC-7"]));
        assert_eq!(fields["governing"], json!(["DOC-1", "DOC-3"]));
    }

    #[test]
    fn test_flatten_prefers_earlier_pass() {
        let processor = PostProcessor::new("ids", &registry()).unwrap();
        let passes = [pass("a", "first"), pass("b", "second")];
        let results = vec![
            ok("a", 0, json!({"title": "A"})),
            ok("b", 0, json!({"title": "B", "extra": 1})),
        ];

        let flat = processor.merge(&results, &passes, "").flatten();

        assert_eq!(flat["title"], json!("A"));
        assert_eq!(flat["extra"], json!(1));
    }

    #[test]
    fn test_flatten_skips_empty_earlier_value() {
        let processor = PostProcessor::new("ids", &registry()).unwrap();
        let passes = [pass("a", "first"), pass("b", "second"), pass("c", "third")];
        let results = vec![
            ok("a", 0, json!({"title": "", "owner": null})),
            ok("b", 0, json!({"title": "Line clearance", "owner": []})),
            ok("c", 0, json!({"title": "Ignored", "owner": "QA"})),
        ];

        let merged = processor.merge(&results, &passes, "");
        let flat = merged.flatten();

        assert_eq!(flat["title"], json!("Line clearance"));
        assert_eq!(flat["owner"], json!("QA"));
        assert!(!merged.has_no_fields());
        assert!(processor
            .merge(&[failed("a", 0)], &passes, "")
            .has_no_fields());
    }
}
