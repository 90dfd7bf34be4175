mod client;
mod output;
mod passes;
mod schema;
mod tiers;

pub use client::{
    AzureAuth, AzureOpenAiClient, AzureOpenAiConfig, ModelClient, ModelRequest,
    RawModelResponse, TransportError,
};
pub use output::{parse, ParseFailure};
pub use passes::{
    CacheScope, LlmPass, LlmPassPipeline, PerChunkResult, PromptContext, UnitGranularity,
};
pub use schema::{ExtractionSchema, FieldSpec, FieldType, ParsedRecord};
pub use tiers::{
    execute_unit, AttemptOutcome, ExtractionFailed, FailureReason, Tier, TierPolicy, TierState,
    UnitExecution, UnitRequest,
};
