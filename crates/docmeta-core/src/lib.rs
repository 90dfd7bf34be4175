pub mod cache;
pub mod config;
pub mod error;
pub mod extract;
pub mod fallback;
pub mod filename;
pub mod ingest;
pub mod mapping;
pub mod pipeline;
pub mod plugins;
pub mod postprocess;
pub mod references;
pub mod registry;

pub use cache::{Fingerprint, UnitCache};
pub use config::{CleaningConfig, ModelSettings, ModelTarget, Settings};
pub use error::{Error, Result};
pub use extract::{
    AzureAuth, AzureOpenAiClient, AzureOpenAiConfig, ExtractionFailed, ExtractionSchema,
    FailureReason, FieldSpec, FieldType, LlmPass, LlmPassPipeline, ModelClient, ModelRequest,
    ParseFailure, ParsedRecord, PerChunkResult, PromptContext, RawModelResponse, Tier, TierPolicy,
    TransportError, UnitGranularity,
};
pub use fallback::{FallbackExtractor, PatternFallback};
pub use filename::{FilenameParser, NoSeeds, SeedFields};
pub use ingest::{
    Chunk, ChunkStrategy, ChunkedDocument, Chunker, CleaningPipeline, CleaningStep, Document,
    DocumentFormat, DocumentLoader, HeadTailChunker, SectionChunker, SourceLocator,
};
pub use mapping::{FieldMapping, SchemaMap, SchemaMapper};
pub use pipeline::{
    ExtractionOutput, LanguageTargets, Pipeline, PipelineBuilder, RunDiagnostics, RunOptions,
    BUILTIN_FIELDS,
};
pub use postprocess::{MergedDocument, MergedRecord, PostProcessor, UnitFailure};
pub use references::{ReferenceExtractor, ReferenceExtractorRegistry, RegexReferenceExtractor};
pub use registry::{ClientProvider, FactoryContext, FamilyFactory, PipelineCache, Registry};
