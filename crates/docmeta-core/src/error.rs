use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::ingest::LoadError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt document {path}: {reason}")]
    CorruptDocument { path: String, reason: String },

    #[error("Unknown reference extractor: {0}")]
    UnknownReferenceExtractor(String),

    #[error("Unknown document family: {0}")]
    UnknownFamily(String),

    #[error("Schema mapping incomplete: missing required fields {}", .missing.join(", "))]
    SchemaMappingIncomplete { missing: Vec<String> },

    #[error("Invalid schema map: {0}")]
    InvalidSchemaMap(String),

    #[error("Invalid chunker configuration: {0}")]
    InvalidChunker(String),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run cancelled after {0:?}")]
    Cancelled(Duration),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable name of the error class.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::CorruptDocument { .. } => "corrupt_document",
            Self::UnknownReferenceExtractor(_) => "unknown_reference_extractor",
            Self::UnknownFamily(_) => "unknown_family",
            Self::SchemaMappingIncomplete { .. } => "schema_mapping_incomplete",
            Self::InvalidSchemaMap(_) => "invalid_schema_map",
            Self::InvalidChunker(_) => "invalid_chunker",
            Self::Pattern(_) => "invalid_pattern",
            Self::Config(_) => "config",
            Self::Cancelled(_) => "cancelled",
            Self::Http(_) => "http",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl Error {
    pub(crate) fn from_load(err: LoadError, path: &Path) -> Self {
        match err {
            LoadError::UnsupportedFormat(format) => Self::UnsupportedFormat(format),
            LoadError::Io(e) => Self::Io(e),
            LoadError::Encoding(reason) | LoadError::Corrupt(reason) => Self::CorruptDocument {
                path: path.display().to_string(),
                reason,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
