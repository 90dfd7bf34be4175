use regex::Regex;

use crate::config::CleaningConfig;
use crate::error::Result;
use crate::extract::{ExtractionSchema, FieldSpec, FieldType, LlmPass, UnitGranularity};
use crate::fallback::PatternFallback;
use crate::filename::{file_stem, FilenameParser, SeedFields};
use crate::ingest::{
    Chunker, CleaningPipeline, FrequentLineRemover, HeadTailChunker, PatternRemover,
    WhitespaceNormalizer,
};
use crate::mapping::SchemaMap;
use crate::pipeline::Pipeline;
use crate::postprocess::PostProcessor;
use crate::references::RegexReferenceExtractor;
use crate::registry::FactoryContext;

use super::generic::base_cleaning;

pub const FAMILY: &str = "sop";
pub const REFERENCE_EXTRACTOR: &str = "sop_ids";

/// List fields holding document references. Values are re-normalized
/// through the `sop_ids` extractor after merging.
pub const REFERENCE_FIELDS: &[&str] = &[
    "governing_quality_module_or_global_standard",
    "governing_documents",
    "related_documents",
    "referenced_documents",
    "external_references",
];

const REFERENCE_PATTERNS: &[&str] = &[
    r"\b[A-Z]{2,6}-\d{3,8}\b",
    r"\bISO\s?\d{4,5}(?::\d{4})?\b",
    r"\bICH\s?[EMQS]\d{1,2}[A-Z]?(?:\(R\d\))?",
    r"\b21\s?CFR\s?(?:Part\s?)?\d+(?:\.\d+)?\b",
    r"https?://[^\s]+",
];

const FILENAME_PATTERN: &str = r"(?x)
    ^(?P<prefix>[A-Za-z]{2,6})[-_\ ]?(?P<number>\d{2,8})
    (?:[_\ ]+[vV]?(?P<version>\d+(?:\.\d+)*))?
    (?:[_\ ]+(?P<status>(?i:draft|effective|approved|obsolete|superseded|retired)))?
    (?:[_\ ]+(?P<language>[A-Za-z]{2}))?$";

const IDENTITY_PROMPT: &str = "You are an expert in quality management documentation for regulated industries. \
Extract the identifying and descriptive metadata of the {document_type} document '{filename}'. \
The document is in {language}. \
Copy values verbatim from the document where possible and leave out any field the document does not state.";

const REFERENCES_PROMPT: &str = "You are an expert in quality management documentation for regulated industries. \
From the {document_type} document '{filename}', list every governing quality module or global standard, \
governing document, related document, internal referenced document and external reference it cites, \
and name its quality system, process, scopes and entities. \
The document is in {language}. Give document numbers exactly as written.";

/// Parses names like `SOP-1234_v2.0_Effective_EN.pdf`. Anything else
/// yields no seeds.
pub struct SopFilenameParser {
    pattern: Regex,
}

impl SopFilenameParser {
    pub const FIELDS: &'static [&'static str] =
        &["name", "document_type", "version", "status", "language"];

    pub fn new() -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(FILENAME_PATTERN)?,
        })
    }
}

impl FilenameParser for SopFilenameParser {
    fn parse(&self, filename: &str) -> SeedFields {
        let mut seeds = SeedFields::new();
        let Some(caps) = self.pattern.captures(file_stem(filename)) else {
            return seeds;
        };

        let prefix = caps["prefix"].to_uppercase();
        seeds.insert("name".into(), format!("{prefix}-{}", &caps["number"]));
        seeds.insert("document_type".into(), prefix);

        if let Some(version) = caps.name("version") {
            seeds.insert("version".into(), version.as_str().to_string());
        }
        if let Some(status) = caps.name("status") {
            seeds.insert("status".into(), capitalize(status.as_str()));
        }
        if let Some(language) = caps.name("language") {
            seeds.insert("language".into(), language.as_str().to_lowercase());
        }
        seeds
    }

    fn provided_fields(&self) -> &[&'static str] {
        Self::FIELDS
    }
}

fn capitalize(word: &str) -> String {
    let lower = word.to_lowercase();
    let mut chars = lower.chars();
    chars
        .next()
        .map(|first| first.to_uppercase().chain(chars).collect())
        .unwrap_or_default()
}

/// Collapses inner whitespace and drops trailing sentence punctuation.
fn standardize(reference: &str) -> String {
    reference
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['.', ',', ';', ':'])
        .to_string()
}

pub fn reference_extractor() -> Result<RegexReferenceExtractor> {
    Ok(RegexReferenceExtractor::new(REFERENCE_PATTERNS)?.with_standardizer(standardize))
}

/// Base cleaning plus removal of controlled-copy stamps, running
/// headers/footers and stray whitespace.
pub fn cleaning(config: &CleaningConfig) -> Result<CleaningPipeline> {
    let stamps = [
        &config.doc_no_regex,
        &config.version_regex,
        &config.uncontrolled_copy_regex,
    ];

    Ok(base_cleaning(config)?
        .with_step(Box::new(PatternRemover::new("document_stamps", &stamps)?))
        .with_step(Box::new(FrequentLineRemover::new(
            config.length_threshold,
            config.frequency_threshold,
        )))
        .with_step(Box::new(WhitespaceNormalizer)))
}

/// Labeled lines in the body, then document number and version from the
/// controlled-copy stamps in the running headers and footers.
pub fn fallback() -> Result<PatternFallback> {
    let label = |name: &str| format!(r"(?mi)^\s*(?:\d+(?:\.\d+)*\.?\s+)?{name}\s*:\s*(.+)$");

    PatternFallback::new("sop_regex")
        .field("title", &label("title"))?
        .field("title", r"(?m)^#{1,3}\s+(.+)$")?
        .field("purpose", &label("purpose"))?
        .field("scope", &label("scope"))?
        .field("status", r"(?mi)^\s*status\s*:\s*(draft|effective|approved|obsolete|superseded|retired)\b")?
        .margin_field("name", r"Doc(?:ument)?\s*No\.?\s*:\s*([A-Z]{2,6}-\d{2,8})")?
        .margin_field("version", r"Version\s*:\s*(\d+(?:\.\d+)*)")
}

pub fn identity_schema() -> ExtractionSchema {
    let text = |name: &str, description: &str| {
        FieldSpec::optional(name, FieldType::String).describe(description)
    };

    ExtractionSchema::new("sop_identity")
        .with_field(text("name", "Document number, e.g. SOP-1234."))
        .with_field(text("title", "Title of the document."))
        .with_field(text("version", "Document version."))
        .with_field(text("status", "Document status, e.g. Effective or Draft."))
        .with_field(text("document_type", "Type of the document, e.g. SOP or Policy."))
        .with_field(text("global_doc_ind", "Global document indicator, Yes or No."))
        .with_field(text("purpose", "Purpose of the document."))
        .with_field(text("scope", "Scope of the document."))
        .with_field(text("target_audience", "Intended target audience."))
        .with_field(text("abbreviations", "Abbreviations used in the document."))
        .with_field(text("owner_department", "Owning department."))
}

pub fn references_schema() -> ExtractionSchema {
    let list = |name: &str, description: &str| {
        FieldSpec::optional(name, FieldType::StringList).describe(description)
    };
    let text = |name: &str, description: &str| {
        FieldSpec::optional(name, FieldType::String).describe(description)
    };

    ExtractionSchema::new("sop_references")
        .with_field(list(
            "governing_quality_module_or_global_standard",
            "Governing quality modules or global standards.",
        ))
        .with_field(list("governing_documents", "Governing documents."))
        .with_field(list("related_documents", "Related documents."))
        .with_field(list("referenced_documents", "Internal referenced documents."))
        .with_field(list("external_references", "External references."))
        .with_field(text("quality_system", "Quality system associated with the document."))
        .with_field(text("process", "Process described by the document."))
        .with_field(text("scopes", "Additional scopes."))
        .with_field(text("entities", "Entities involved."))
}

pub fn schema_map() -> SchemaMap {
    SchemaMap::identity([
        "name",
        "version",
        "status",
        "language",
        "title",
        "document_type",
        "purpose",
        "scope",
        "target_audience",
        "abbreviations",
    ])
    .field(
        "references.governing_quality_module_or_global_standard",
        "governing_quality_module_or_global_standard",
    )
    .field("references.governing_documents", "governing_documents")
    .field("references.related_documents", "related_documents")
    .field("references.referenced_documents", "referenced_documents")
    .field("references.external_references", "external_references")
    .field("references.found_in_text", "references")
}

pub fn build(context: &FactoryContext) -> Result<Pipeline> {
    let policy = context.settings.tier_policy(&context.language)?;
    let passes = context
        .pass_pipeline(vec![
            LlmPass::new("sop_identity", identity_schema(), IDENTITY_PROMPT, policy.clone()),
            LlmPass::new("sop_references", references_schema(), REFERENCES_PROMPT, policy),
        ])
        .with_granularity(UnitGranularity::Document);

    let post_processor = PostProcessor::new(REFERENCE_EXTRACTOR, &context.references)?
        .with_reference_fields(REFERENCE_FIELDS.iter().copied());

    context
        .builder(FAMILY)
        .document_type("SOP")
        .chunker(Chunker::new(Box::new(HeadTailChunker::default())))
        .cleaning(cleaning(&context.settings.cleaning)?)
        .passes(passes)
        .post_processor(post_processor)
        .filename_parser(Box::new(SopFilenameParser::new()?))
        .fallback(Box::new(fallback()?))
        .schema_map(schema_map())
        .build()
}
