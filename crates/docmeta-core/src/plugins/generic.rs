use regex::Regex;

use crate::config::CleaningConfig;
use crate::error::Result;
use crate::extract::{ExtractionSchema, FieldSpec, FieldType, LlmPass, UnitGranularity};
use crate::filename::{file_stem, FilenameParser, SeedFields};
use crate::ingest::{
    Chunker, CleaningPipeline, ExcessBreakLineRemover, MarkupStripper, PatternRemover,
    SectionChunker, SelectionTagReplacer,
};
use crate::mapping::SchemaMap;
use crate::pipeline::Pipeline;
use crate::postprocess::PostProcessor;
use crate::references::RegexReferenceExtractor;
use crate::registry::FactoryContext;

pub const FAMILY: &str = "generic";
pub const REFERENCE_EXTRACTOR: &str = "generic_refs";

const REFERENCE_PATTERNS: &[&str] = &[
    r"https?://[^\s]+",
    r"\b\w+\.(?:pdf|docx|xlsx|pptx|txt|csv|json|xml|html|mp4|mp3|zip)\b",
];

const SYSTEM_PROMPT: &str = "You are an expert at extracting general metadata from various types of documents. \
Your task is to identify and extract key metadata fields from the provided document content. \
Focus on providing a concise summary and relevant keywords. \
The document is in {language}.";

/// Splits a trailing `v1.2.3` style version off the file stem.
pub struct GenericFilenameParser {
    version: Regex,
    version_suffix: Regex,
    language: String,
}

impl GenericFilenameParser {
    pub const FIELDS: &'static [&'static str] = &[
        "name",
        "version",
        "status",
        "global_doc_ind",
        "document_type",
        "language",
    ];

    pub fn new(language: impl Into<String>) -> Result<Self> {
        Ok(Self {
            version: Regex::new(r"[vV]?(\d+\.\d+(?:\.\d+)*)")?,
            version_suffix: Regex::new(r"[_\-.]*[vV]?\d+\.\d+(?:\.\d+)*")?,
            language: language.into(),
        })
    }
}

impl FilenameParser for GenericFilenameParser {
    fn parse(&self, filename: &str) -> SeedFields {
        let stem = file_stem(filename);

        let (name, version) = match self.version.captures(stem) {
            Some(caps) => {
                let version = caps.get(1).map_or("", |m| m.as_str()).to_string();
                let stripped = self.version_suffix.replace(stem, "");
                let name = stripped.trim_matches(['_', '.', '-']);
                let name = if name.is_empty() { stem } else { name };
                (name.to_string(), version)
            }
            None => (stem.to_string(), String::new()),
        };

        let name = if name.trim().is_empty() {
            "unknown".to_string()
        } else {
            name
        };

        SeedFields::from([
            ("name".into(), name),
            ("version".into(), version),
            ("status".into(), "unknown".into()),
            ("global_doc_ind".into(), "No".into()),
            ("document_type".into(), FAMILY.into()),
            ("language".into(), self.language.clone()),
        ])
    }

    fn provided_fields(&self) -> &[&'static str] {
        Self::FIELDS
    }
}

pub fn reference_extractor() -> Result<RegexReferenceExtractor> {
    RegexReferenceExtractor::new(REFERENCE_PATTERNS)
}

/// Cleaning shared by every built-in family: break-line collapse, configured
/// pattern removal, checkbox tags, then markup stripping.
pub fn base_cleaning(config: &CleaningConfig) -> Result<CleaningPipeline> {
    Ok(CleaningPipeline::new()
        .with_step(Box::new(ExcessBreakLineRemover::new()?))
        .with_step(Box::new(PatternRemover::new(
            "patterns",
            &config.patterns_to_remove,
        )?))
        .with_step(Box::new(SelectionTagReplacer::new(&config.selection_mappings)))
        .with_step(Box::new(MarkupStripper)))
}

pub fn schema() -> ExtractionSchema {
    ExtractionSchema::new("generic_metadata")
        .with_field(
            FieldSpec::optional("summary", FieldType::String)
                .describe("A brief summary of the document."),
        )
        .with_field(
            FieldSpec::optional("keywords", FieldType::StringList)
                .describe("Keywords describing the document content."),
        )
}

pub fn schema_map() -> SchemaMap {
    SchemaMap::identity([
        "name",
        "version",
        "status",
        "document_type",
        "language",
        "summary",
        "keywords",
        "references",
    ])
}

pub fn build(context: &FactoryContext) -> Result<Pipeline> {
    let policy = context.settings.tier_policy(&context.language)?;
    let passes = context
        .pass_pipeline(vec![LlmPass::new("generic", schema(), SYSTEM_PROMPT, policy)])
        .with_granularity(UnitGranularity::PerChunk);

    context
        .builder(FAMILY)
        .document_type(FAMILY)
        .chunker(Chunker::new(Box::new(SectionChunker::default())))
        .cleaning(base_cleaning(&context.settings.cleaning)?)
        .passes(passes)
        .post_processor(PostProcessor::new(REFERENCE_EXTRACTOR, &context.references)?)
        .filename_parser(Box::new(GenericFilenameParser::new(&context.language)?))
        .schema_map(schema_map())
        .build()
}
