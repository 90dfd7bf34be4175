mod chunker;
mod cleaning;
mod loader;

pub use chunker::{
    Chunk, ChunkStrategy, ChunkedDocument, Chunker, HeadTailChunker, SectionChunker,
    SourceLocator,
};
pub use cleaning::{
    CleaningPipeline, CleaningStep, ExcessBreakLineRemover, FnStep, FrequentLineRemover,
    MarkupStripper, PatternRemover, SelectionTagReplacer, WhitespaceNormalizer,
};
pub use loader::{
    hash_bytes, CompositeLoader, Document, DocumentFormat, DocumentLoader, EmailLoader,
    HtmlLoader, JsonDocumentLoader, LoadError, LoadResult, PlainTextLoader, Section,
};
