use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::loader::{CompositeLoader, Document, DocumentLoader, Section};
use crate::error::{Error, Result};

/// Where a chunk came from in its document. Opaque to everything past the chunker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLocator {
    Whole,
    Page { number: u32 },
    Section { index: usize, title: Option<String> },
    Window { start: usize, end: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub locator: SourceLocator,
    pub metadata: BTreeMap<String, String>,
}

impl Chunk {
    #[must_use]
    pub fn new(index: usize, text: impl Into<String>, locator: SourceLocator) -> Self {
        Self {
            index,
            text: text.into(),
            locator,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Same position and metadata, different text.
    #[must_use]
    pub fn with_text(&self, text: String) -> Self {
        Self {
            index: self.index,
            text,
            locator: self.locator.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

pub trait ChunkStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Must preserve reading order; chunk indices start at 0 and are contiguous.
    fn chunk(&self, document: &Document) -> Vec<Chunk>;
}

/// Keeps the start and end of very long documents, where identifying
/// metadata (titles, numbers, signatures, revision tables) usually lives.
#[derive(Debug, Clone)]
pub struct HeadTailChunker {
    max_length: usize,
    head_length: usize,
}

impl HeadTailChunker {
    pub const DEFAULT_MAX_LENGTH: usize = 160_000;
    pub const DEFAULT_HEAD_LENGTH: usize = 80_000;

    pub fn new(max_length: usize, head_length: usize) -> Result<Self> {
        if head_length == 0 {
            return Err(Error::InvalidChunker("head_length must be positive".into()));
        }
        if head_length.saturating_mul(2) > max_length {
            return Err(Error::InvalidChunker(format!(
                "2 * head_length ({}) cannot exceed max_length ({max_length})",
                head_length.saturating_mul(2)
            )));
        }
        Ok(Self {
            max_length,
            head_length,
        })
    }
}

impl Default for HeadTailChunker {
    fn default() -> Self {
        Self {
            max_length: Self::DEFAULT_MAX_LENGTH,
            head_length: Self::DEFAULT_HEAD_LENGTH,
        }
    }
}

impl ChunkStrategy for HeadTailChunker {
    fn name(&self) -> &'static str {
        "head_tail"
    }

    fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let text = &document.text;
        let total = text.chars().count();

        if total <= self.max_length {
            return vec![Chunk::new(0, text.clone(), SourceLocator::Whole)];
        }

        let head: String = text.chars().take(self.head_length).collect();
        let tail: String = text.chars().skip(total - self.head_length).collect();

        tracing::debug!(
            total_chars = total,
            kept_chars = self.head_length * 2,
            "Truncating document to head and tail"
        );

        vec![Chunk::new(0, head + &tail, SourceLocator::Whole)
            .with_metadata("truncated", "true")
            .with_metadata("original_chars", total.to_string())]
    }
}

/// Packs consecutive document sections into chunks of at most `max_chars`.
#[derive(Debug, Clone)]
pub struct SectionChunker {
    max_chars: usize,
}

impl SectionChunker {
    pub const DEFAULT_MAX_CHARS: usize = 12_000;

    pub fn new(max_chars: usize) -> Result<Self> {
        if max_chars == 0 {
            return Err(Error::InvalidChunker("max_chars must be positive".into()));
        }
        Ok(Self { max_chars })
    }
}

impl Default for SectionChunker {
    fn default() -> Self {
        Self {
            max_chars: Self::DEFAULT_MAX_CHARS,
        }
    }
}

impl ChunkStrategy for SectionChunker {
    fn name(&self) -> &'static str {
        "section"
    }

    fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let whole;
        let sections: &[Section] = if document.sections.is_empty() {
            whole = [Section::new(document.text.clone(), 0, document.text.len())];
            &whole
        } else {
            &document.sections
        };

        let mut packer = Packer::new(self.max_chars);

        for (i, section) in sections.iter().enumerate() {
            let text = section.content.trim();
            if text.is_empty() {
                continue;
            }

            let locator = section_locator(i, section);

            if char_len(text) > self.max_chars {
                packer.flush();
                for piece in split_coherent(text, self.max_chars) {
                    packer.emit(piece, locator.clone());
                }
                continue;
            }

            packer.push(text, locator);
        }

        packer.finish()
    }
}

fn section_locator(index: usize, section: &Section) -> SourceLocator {
    match (section.page, &section.title) {
        (Some(number), None) => SourceLocator::Page { number },
        _ => SourceLocator::Section {
            index,
            title: section.title.clone(),
        },
    }
}

struct Packer {
    max_chars: usize,
    chunks: Vec<Chunk>,
    buffer: String,
    buffer_chars: usize,
    locator: Option<SourceLocator>,
}

impl Packer {
    const fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            chunks: Vec::new(),
            buffer: String::new(),
            buffer_chars: 0,
            locator: None,
        }
    }

    fn push(&mut self, text: &str, locator: SourceLocator) {
        let len = char_len(text);
        if !self.buffer.is_empty() && self.buffer_chars + 2 + len > self.max_chars {
            self.flush();
        }
        if !self.buffer.is_empty() {
            self.buffer.push_str("\n\n");
            self.buffer_chars += 2;
        }
        self.buffer.push_str(text);
        self.buffer_chars += len;
        self.locator.get_or_insert(locator);
    }

    fn emit(&mut self, text: String, locator: SourceLocator) {
        let index = self.chunks.len();
        self.chunks.push(Chunk::new(index, text, locator));
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.buffer);
        let locator = self.locator.take().unwrap_or(SourceLocator::Whole);
        self.buffer_chars = 0;
        self.emit(text, locator);
    }

    fn finish(mut self) -> Vec<Chunk> {
        self.flush();
        self.chunks
    }
}

#[derive(Clone, Copy)]
enum Boundary {
    Paragraph,
    Sentence,
    Word,
}

impl Boundary {
    const fn joiner(self) -> &'static str {
        match self {
            Self::Paragraph => "\n\n",
            Self::Sentence | Self::Word => " ",
        }
    }

    fn split(self, text: &str) -> Vec<&str> {
        let pieces: Vec<&str> = match self {
            Self::Paragraph => text.split("\n\n").collect(),
            Self::Sentence => split_sentences(text),
            Self::Word => text.split_whitespace().collect(),
        };
        pieces
            .into_iter()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }
}

/// Splits oversized text at the coarsest boundary that yields more than one
/// piece, then greedily repacks. Falls back to hard character splits only
/// for single words longer than `max_chars`.
fn split_coherent(text: &str, max_chars: usize) -> Vec<String> {
    if char_len(text) <= max_chars {
        return vec![text.to_string()];
    }

    for boundary in [Boundary::Paragraph, Boundary::Sentence, Boundary::Word] {
        let pieces = boundary.split(text);
        if pieces.len() > 1 {
            return repack(&pieces, max_chars, boundary.joiner());
        }
    }

    hard_split(text, max_chars)
}

fn repack(pieces: &[&str], max_chars: usize, joiner: &str) -> Vec<String> {
    let joiner_len = char_len(joiner);
    let mut out = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for piece in pieces {
        let len = char_len(piece);

        if len > max_chars {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
                current_len = 0;
            }
            out.extend(split_coherent(piece, max_chars));
            continue;
        }

        if !current.is_empty() && current_len + joiner_len + len > max_chars {
            out.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push_str(joiner);
            current_len += joiner_len;
        }
        current.push_str(piece);
        current_len += len;
    }

    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;

    for (i, c) in text.char_indices() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let next = i + c.len_utf8();
        if text[next..].starts_with(char::is_whitespace) {
            pieces.push(&text[start..next]);
            start = next;
        }
    }
    pieces.push(&text[start..]);
    pieces
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|c| c.iter().collect())
        .collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[derive(Debug, Clone)]
pub struct ChunkedDocument {
    pub document: Document,
    pub chunks: Vec<Chunk>,
}

/// Binds a loader (format extractor) to a chunk strategy.
pub struct Chunker {
    loader: Box<dyn DocumentLoader>,
    strategy: Box<dyn ChunkStrategy>,
}

impl Chunker {
    #[must_use]
    pub fn new(strategy: Box<dyn ChunkStrategy>) -> Self {
        Self {
            loader: Box::new(CompositeLoader::default()),
            strategy,
        }
    }

    #[must_use]
    pub fn with_loader(mut self, loader: Box<dyn DocumentLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn chunk_document(&self, document: &Document) -> Vec<Chunk> {
        self.strategy.chunk(document)
    }

    pub async fn chunk_file(&self, path: &Path) -> Result<ChunkedDocument> {
        let document = self
            .loader
            .load_file(path)
            .await
            .map_err(|e| Error::from_load(e, path))?;

        let chunks = self.chunk_document(&document);

        tracing::debug!(
            file = %document.filename,
            format = %document.format,
            strategy = self.strategy.name(),
            chunks = chunks.len(),
            "Chunked document"
        );

        Ok(ChunkedDocument { document, chunks })
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(Box::new(HeadTailChunker::default()))
    }
}
