use std::collections::BTreeMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Encoding error: {0}")]
    Encoding(String),
    #[error("Corrupt document: {0}")]
    Corrupt(String),
}

pub type LoadResult<T> = Result<T, LoadError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Html,
    Json,
    Email,
    Pdf,
    Docx,
    Xlsx,
    Pptx,
    Msg,
}

impl DocumentFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "txt" | "text" => Some(Self::PlainText),
            "md" | "markdown" => Some(Self::Markdown),
            "html" | "htm" => Some(Self::Html),
            "json" => Some(Self::Json),
            "eml" => Some(Self::Email),
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "xlsx" => Some(Self::Xlsx),
            "pptx" => Some(Self::Pptx),
            "msg" => Some(Self::Msg),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> LoadResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| LoadError::UnsupportedFormat("no extension".into()))?;

        Self::from_extension(ext).ok_or_else(|| LoadError::UnsupportedFormat(ext.into()))
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PlainText => "plain_text",
            Self::Markdown => "markdown",
            Self::Html => "html",
            Self::Json => "json",
            Self::Email => "email",
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Xlsx => "xlsx",
            Self::Pptx => "pptx",
            Self::Msg => "msg",
        }
    }
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub title: Option<String>,
    pub level: u8,
    pub page: Option<u32>,
    pub content: String,
    pub start_offset: usize,
    pub end_offset: usize,
}

impl Section {
    #[must_use]
    pub fn new(content: String, start_offset: usize, end_offset: usize) -> Self {
        Self {
            title: None,
            level: 0,
            page: None,
            content,
            start_offset,
            end_offset,
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: String, level: u8) -> Self {
        self.title = Some(title);
        self.level = level;
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub filename: String,
    pub format: DocumentFormat,
    pub text: String,
    pub sections: Vec<Section>,
    pub content_hash: String,
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    #[must_use]
    pub fn new(format: DocumentFormat, text: String) -> Self {
        let content_hash = hash_bytes(text.as_bytes());
        Self {
            id: Uuid::now_v7(),
            filename: String::new(),
            format,
            text,
            sections: Vec::new(),
            content_hash,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    #[must_use]
    pub fn with_sections(mut self, sections: Vec<Section>) -> Self {
        self.sections = sections;
        self
    }

    #[must_use]
    pub fn with_content_hash(mut self, hash: String) -> Self {
        self.content_hash = hash;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn page_count(&self) -> Option<u32> {
        self.sections.iter().filter_map(|s| s.page).max()
    }
}

/// SHA-256 of raw document bytes, hex encoded.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[async_trait::async_trait]
pub trait DocumentLoader: Send + Sync {
    fn supported_formats(&self) -> &[DocumentFormat];

    fn can_load(&self, format: DocumentFormat) -> bool {
        self.supported_formats().contains(&format)
    }

    async fn load_bytes(&self, data: &[u8], format: DocumentFormat) -> LoadResult<Document>;

    async fn load_file(&self, path: &Path) -> LoadResult<Document> {
        let format = DocumentFormat::from_path(path)?;

        if !self.can_load(format) {
            return Err(LoadError::UnsupportedFormat(format.to_string()));
        }

        let data = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let document = self.load_bytes(&data, format).await?;
        Ok(document
            .with_filename(filename)
            .with_content_hash(hash_bytes(&data)))
    }
}

fn decode_utf8(data: &[u8]) -> LoadResult<String> {
    let text = String::from_utf8(data.to_vec()).map_err(|e| LoadError::Encoding(e.to_string()))?;
    Ok(text.strip_prefix('\u{feff}').map(str::to_string).unwrap_or(text))
}

pub struct PlainTextLoader;

impl PlainTextLoader {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for PlainTextLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DocumentLoader for PlainTextLoader {
    fn supported_formats(&self) -> &[DocumentFormat] {
        &[DocumentFormat::PlainText, DocumentFormat::Markdown]
    }

    async fn load_bytes(&self, data: &[u8], format: DocumentFormat) -> LoadResult<Document> {
        let text = decode_utf8(data)?;

        let sections = if text.contains('\u{c}') {
            page_sections(&text)
        } else if format == DocumentFormat::Markdown {
            markdown_sections(&text)
        } else {
            vec![Section::new(text.clone(), 0, text.len())]
        };

        Ok(Document::new(format, text).with_sections(sections))
    }
}

/// Form feeds separate pages in text exported from paginated formats.
fn page_sections(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut offset = 0;

    for (i, page) in text.split('\u{c}').enumerate() {
        let end = offset + page.len();
        if !page.trim().is_empty() {
            let number = u32::try_from(i + 1).unwrap_or(u32::MAX);
            sections.push(Section::new(page.to_string(), offset, end).with_page(number));
        }
        offset = end + '\u{c}'.len_utf8();
    }

    sections
}

/// Sections start at each heading line; the heading stays part of the content.
fn markdown_sections(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current_start = 0;
    let mut current_title: Option<(String, u8)> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        if let Some(level) = heading_level(line) {
            if offset > current_start {
                sections.push(build_section(text, current_start, offset, current_title.take()));
            }
            let title = line.trim().trim_start_matches('#').trim().to_string();
            current_title = Some((title, level));
            current_start = offset;
        }
        offset += line.len();
    }

    if text.len() > current_start || current_title.is_some() {
        sections.push(build_section(text, current_start, text.len(), current_title));
    }

    sections
}

fn build_section(text: &str, start: usize, end: usize, title: Option<(String, u8)>) -> Section {
    let section = Section::new(text[start..end].to_string(), start, end);
    match title {
        Some((title, level)) => section.with_title(title, level),
        None => section,
    }
}

fn heading_level(line: &str) -> Option<u8> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('#') {
        return None;
    }

    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if (1..=6).contains(&level) && trimmed.chars().nth(level) == Some(' ') {
        u8::try_from(level).ok()
    } else {
        None
    }
}

/// Document-intelligence exports: markdown under `md_di` (preferred) or
/// `md_py`, with an optional `pages` array of per-page text.
pub struct JsonDocumentLoader;

impl JsonDocumentLoader {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for JsonDocumentLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct JsonExport {
    md_di: Option<String>,
    md_py: Option<String>,
    #[serde(default)]
    pages: Vec<String>,
    title: Option<String>,
}

#[async_trait::async_trait]
impl DocumentLoader for JsonDocumentLoader {
    fn supported_formats(&self) -> &[DocumentFormat] {
        &[DocumentFormat::Json]
    }

    async fn load_bytes(&self, data: &[u8], format: DocumentFormat) -> LoadResult<Document> {
        let export: JsonExport =
            serde_json::from_slice(data).map_err(|e| LoadError::Corrupt(e.to_string()))?;

        let markdown = export
            .md_di
            .filter(|s| !s.trim().is_empty())
            .or_else(|| export.md_py.filter(|s| !s.trim().is_empty()));

        let (text, sections) = match markdown {
            Some(text) => {
                let sections = markdown_sections(&text);
                (text, sections)
            }
            None if !export.pages.is_empty() => joined_pages(&export.pages),
            None => {
                return Err(LoadError::Corrupt(
                    "JSON export must contain 'md_di', 'md_py' or 'pages'".into(),
                ))
            }
        };

        let mut document = Document::new(format, text).with_sections(sections);
        if let Some(title) = export.title {
            document = document.with_metadata("title", title);
        }
        Ok(document)
    }
}

fn joined_pages(pages: &[String]) -> (String, Vec<Section>) {
    let mut text = String::new();
    let mut sections = Vec::with_capacity(pages.len());

    for (i, page) in pages.iter().enumerate() {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        let start = text.len();
        text.push_str(page);
        let number = u32::try_from(i + 1).unwrap_or(u32::MAX);
        sections.push(Section::new(page.clone(), start, text.len()).with_page(number));
    }

    (text, sections)
}

fn html_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title")?;
    let title = html[start..end].trim();
    (!title.is_empty()).then(|| title.to_string())
}

pub struct HtmlLoader;

impl HtmlLoader {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for HtmlLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DocumentLoader for HtmlLoader {
    fn supported_formats(&self) -> &[DocumentFormat] {
        &[DocumentFormat::Html]
    }

    async fn load_bytes(&self, data: &[u8], format: DocumentFormat) -> LoadResult<Document> {
        let text = decode_utf8(data)?;
        let title = html_title(&text);

        let section = Section::new(text.clone(), 0, text.len());
        let mut document = Document::new(format, text).with_sections(vec![section]);
        if let Some(title) = title {
            document = document.with_metadata("title", title);
        }
        Ok(document)
    }
}

const EMAIL_HEADERS: &[&str] = &["subject", "from", "to", "cc", "date", "message-id"];

type Headers = BTreeMap<String, String>;

/// RFC 822 messages. Headers listed in `EMAIL_HEADERS` land in the document
/// metadata with encoded words decoded; for multipart bodies the first
/// `text/plain` part is used. Base64 and quoted-printable bodies are decoded
/// before charset conversion.
pub struct EmailLoader;

impl EmailLoader {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for EmailLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DocumentLoader for EmailLoader {
    fn supported_formats(&self) -> &[DocumentFormat] {
        &[DocumentFormat::Email]
    }

    async fn load_bytes(&self, data: &[u8], format: DocumentFormat) -> LoadResult<Document> {
        let raw = decode_utf8(data)?.replace("\r\n", "\n");
        let (headers, body) = split_headers(&raw)?;
        if headers.is_empty() {
            return Err(LoadError::Corrupt("email has no headers".into()));
        }

        let text = message_text(&headers, body)?;
        let mut document = Document::new(format, text.trim().to_string());
        let section = Section::new(document.text.clone(), 0, document.text.len());
        document = document.with_sections(vec![section]);

        for key in EMAIL_HEADERS {
            if let Some(value) = headers.get(*key) {
                document = document.with_metadata(*key, decode_header(value));
            }
        }
        Ok(document)
    }
}

/// Reads header fields up to the first blank line, or up to the first line
/// that is neither a field nor a continuation; the rest is the body.
fn split_headers(raw: &str) -> LoadResult<(Headers, &str)> {
    let mut headers = Headers::new();
    let mut last_key: Option<String> = None;
    let mut offset = 0;

    for line in raw.split_inclusive('\n') {
        let content = line.trim_end_matches('\n');

        if content.trim().is_empty() {
            offset += line.len();
            break;
        }

        if content.starts_with([' ', '\t']) {
            match last_key.as_ref().and_then(|k| headers.get_mut(k)) {
                Some(value) => {
                    value.push(' ');
                    value.push_str(content.trim());
                    offset += line.len();
                    continue;
                }
                None => break,
            }
        }

        let Some((key, value)) = header_field(content) else {
            break;
        };
        headers.insert(key.clone(), value);
        last_key = Some(key);
        offset += line.len();
    }

    Ok((headers, &raw[offset..]))
}

fn header_field(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once(':')?;
    let valid = !key.is_empty() && key.chars().all(|c| c.is_ascii_graphic());
    valid.then(|| (key.to_ascii_lowercase(), value.trim().to_string()))
}

fn message_text(headers: &Headers, body: &str) -> LoadResult<String> {
    let content_type = headers
        .get("content-type")
        .map_or("text/plain", String::as_str);

    if let Some(boundary) = multipart_boundary(content_type) {
        let parts = multipart_parts(body, &boundary);
        let pick = parts
            .iter()
            .find(|(h, _)| {
                h.get("content-type")
                    .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("text/plain"))
            })
            .or_else(|| parts.first());
        if let Some((part_headers, part_body)) = pick {
            return message_text(part_headers, part_body);
        }
    }

    let bytes = decode_transfer(body, headers.get("content-transfer-encoding"))?;
    let charset = content_type_param(content_type, "charset").unwrap_or_else(|| "utf-8".into());
    decode_charset(&charset, bytes)
        .ok_or_else(|| LoadError::Encoding(format!("body is not valid {charset}")))
}

fn content_type_param(content_type: &str, name: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    if !content_type.to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    content_type_param(content_type, "boundary")
}

fn multipart_parts<'a>(body: &'a str, boundary: &str) -> Vec<(Headers, &'a str)> {
    let delimiter = format!("--{boundary}");
    body.split(delimiter.as_str())
        .skip(1)
        .filter(|p| !p.starts_with("--"))
        .map(|part| {
            // Skip the remainder of the delimiter line.
            let part = part.split_once('\n').map_or("", |(_, rest)| rest);
            match split_headers(part) {
                Ok((headers, body)) if !headers.is_empty() => (headers, body),
                _ => (Headers::new(), part),
            }
        })
        .collect()
}

fn decode_transfer(body: &str, encoding: Option<&String>) -> LoadResult<Vec<u8>> {
    match encoding.map(|e| e.trim().to_ascii_lowercase()).as_deref() {
        Some("base64") => {
            let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            STANDARD
                .decode(compact)
                .map_err(|e| LoadError::Corrupt(format!("invalid base64 body: {e}")))
        }
        Some("quoted-printable") => Ok(decode_quoted_printable(body)),
        _ => Ok(body.as_bytes().to_vec()),
    }
}

fn decode_quoted_printable(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'=' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        // Soft line break.
        if bytes.get(i + 1) == Some(&b'\n') {
            i += 2;
            continue;
        }

        let hex = bytes
            .get(i + 1..i + 3)
            .and_then(|pair| std::str::from_utf8(pair).ok())
            .and_then(|pair| u8::from_str_radix(pair, 16).ok());
        match hex {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                out.push(b'=');
                i += 1;
            }
        }
    }
    out
}

fn decode_charset(charset: &str, bytes: Vec<u8>) -> Option<String> {
    let charset = charset.split('*').next().unwrap_or(charset);
    match charset.trim().to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" | "us-ascii" | "ascii" => String::from_utf8(bytes).ok(),
        "iso-8859-1" | "latin1" | "latin-1" => Some(bytes.into_iter().map(char::from).collect()),
        _ => None,
    }
}

/// Decodes RFC 2047 encoded words. Whitespace between adjacent encoded words
/// is dropped; words that cannot be decoded are kept verbatim.
fn decode_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    let mut after_word = false;

    while let Some(start) = rest.find("=?") {
        let (before, candidate) = rest.split_at(start);
        match decode_encoded_word(candidate) {
            Some((decoded, consumed)) => {
                if !(after_word && before.trim().is_empty()) {
                    out.push_str(before);
                }
                out.push_str(&decoded);
                rest = &candidate[consumed..];
                after_word = true;
            }
            None => {
                out.push_str(before);
                out.push_str("=?");
                rest = &candidate[2..];
                after_word = false;
            }
        }
    }
    out.push_str(rest);
    out
}

/// `=?charset?B|Q?text?=` to its text and the number of bytes consumed.
fn decode_encoded_word(word: &str) -> Option<(String, usize)> {
    let inner = word.strip_prefix("=?")?;
    let (charset, inner) = inner.split_once('?')?;
    let (encoding, inner) = inner.split_once('?')?;
    let end = inner.find("?=")?;
    let text = &inner[..end];
    if text.contains(char::is_whitespace) {
        return None;
    }

    let bytes = match encoding {
        "B" | "b" => STANDARD.decode(text).ok()?,
        "Q" | "q" => decode_quoted_printable(&text.replace('_', " ")),
        _ => return None,
    };
    let consumed = 2 + charset.len() + 1 + encoding.len() + 1 + end + 2;
    Some((decode_charset(charset, bytes)?, consumed))
}

/// Dispatches to the first registered loader that handles a format.
pub struct CompositeLoader {
    loaders: Vec<Box<dyn DocumentLoader>>,
}

impl CompositeLoader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            loaders: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_loader(mut self, loader: Box<dyn DocumentLoader>) -> Self {
        self.loaders.push(loader);
        self
    }

    pub fn add_loader(&mut self, loader: Box<dyn DocumentLoader>) {
        self.loaders.push(loader);
    }

    fn find_loader(&self, format: DocumentFormat) -> Option<&dyn DocumentLoader> {
        self.loaders
            .iter()
            .find(|l| l.can_load(format))
            .map(AsRef::as_ref)
    }
}

impl Default for CompositeLoader {
    fn default() -> Self {
        Self::new()
            .with_loader(Box::new(PlainTextLoader::new()))
            .with_loader(Box::new(JsonDocumentLoader::new()))
            .with_loader(Box::new(HtmlLoader::new()))
            .with_loader(Box::new(EmailLoader::new()))
    }
}

#[async_trait::async_trait]
impl DocumentLoader for CompositeLoader {
    fn supported_formats(&self) -> &[DocumentFormat] {
        &[
            DocumentFormat::PlainText,
            DocumentFormat::Markdown,
            DocumentFormat::Html,
            DocumentFormat::Json,
            DocumentFormat::Email,
            DocumentFormat::Pdf,
            DocumentFormat::Docx,
            DocumentFormat::Xlsx,
            DocumentFormat::Pptx,
            DocumentFormat::Msg,
        ]
    }

    fn can_load(&self, format: DocumentFormat) -> bool {
        self.find_loader(format).is_some()
    }

    async fn load_bytes(&self, data: &[u8], format: DocumentFormat) -> LoadResult<Document> {
        let loader = self
            .find_loader(format)
            .ok_or_else(|| LoadError::UnsupportedFormat(format.to_string()))?;

        loader.load_bytes(data, format).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_text_loader() {
        let loader = PlainTextLoader::new();
        let doc = loader
            .load_bytes(b"Hello, world!", DocumentFormat::PlainText)
            .await
            .unwrap();

        assert_eq!(doc.text, "Hello, world!");
        assert_eq!(doc.sections.len(), 1);
    }

    #[tokio::test]
    async fn test_markdown_sections_keep_headings() {
        let loader = PlainTextLoader::new();
        let data = b"Preamble\n# Title\n\nIntro\n\n## Section 1\n\nContent 1\n";

        let doc = loader
            .load_bytes(data, DocumentFormat::Markdown)
            .await
            .unwrap();

        assert_eq!(doc.sections.len(), 3);
        assert_eq!(doc.sections[1].title.as_deref(), Some("Title"));
        assert!(doc.sections[2].content.starts_with("## Section 1"));
        let rebuilt: String = doc.sections.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(rebuilt, doc.text);
    }

    #[tokio::test]
    async fn test_form_feeds_become_pages() {
        let loader = PlainTextLoader::new();
        let doc = loader
            .load_bytes(b"page one\x0cpage two\x0c", DocumentFormat::PlainText)
            .await
            .unwrap();

        assert_eq!(doc.sections.len(), 2);
        assert_eq!(doc.sections[1].page, Some(2));
        assert_eq!(doc.page_count(), Some(2));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_encoding_error() {
        let loader = PlainTextLoader::new();
        let err = loader
            .load_bytes(&[0xff, 0xfe, 0x00], DocumentFormat::PlainText)
            .await
            .unwrap_err();

        assert!(matches!(err, LoadError::Encoding(_)));
    }

    #[tokio::test]
    async fn test_json_export_prefers_md_di() {
        let loader = JsonDocumentLoader::new();
        let data = br##"{"md_di": "# Doc\n\nBody", "md_py": "other", "title": "T"}"##;

        let doc = loader.load_bytes(data, DocumentFormat::Json).await.unwrap();

        assert_eq!(doc.text, "# Doc\n\nBody");
        assert_eq!(doc.metadata.get("title").map(String::as_str), Some("T"));
    }

    #[tokio::test]
    async fn test_json_export_pages() {
        let loader = JsonDocumentLoader::new();
        let data = br#"{"pages": ["first", "second"]}"#;

        let doc = loader.load_bytes(data, DocumentFormat::Json).await.unwrap();

        assert_eq!(doc.text, "first\n\nsecond");
        assert_eq!(doc.sections[1].page, Some(2));
    }

    #[tokio::test]
    async fn test_json_export_without_text_is_corrupt() {
        let loader = JsonDocumentLoader::new();
        let err = loader
            .load_bytes(br#"{"other": 1}"#, DocumentFormat::Json)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Corrupt(_)));

        let err = loader
            .load_bytes(b"{not json", DocumentFormat::Json)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_email_headers_and_body() {
        let loader = EmailLoader::new();
        let data = b"Subject: Quarterly\r\n report\r\nFrom: a@example.com\r\n\r\nHello team.\r\n";

        let doc = loader.load_bytes(data, DocumentFormat::Email).await.unwrap();

        assert_eq!(
            doc.metadata.get("subject").map(String::as_str),
            Some("Quarterly report")
        );
        assert_eq!(doc.text, "Hello team.");
    }

    #[tokio::test]
    async fn test_email_multipart_picks_text_part() {
        let loader = EmailLoader::new();
        let data = b"Subject: x\nContent-Type: multipart/alternative; boundary=\"b1\"\n\n--b1\nContent-Type: text/html\n\n<p>html</p>\n--b1\nContent-Type: text/plain\n\nplain body\n--b1--\n";

        let doc = loader.load_bytes(data, DocumentFormat::Email).await.unwrap();

        assert_eq!(doc.text, "plain body");
    }

    #[tokio::test]
    async fn test_email_without_blank_line_keeps_body() {
        let doc = EmailLoader::new()
            .load_bytes(b"Subject: hi\nHello world body", DocumentFormat::Email)
            .await
            .unwrap();

        assert_eq!(doc.metadata.get("subject").map(String::as_str), Some("hi"));
        assert_eq!(doc.text, "Hello world body");
    }

    #[tokio::test]
    async fn test_email_decodes_base64_body_and_encoded_subject() {
        let data = b"Subject: =?UTF-8?B?UmFwcG9ydA==?= =?UTF-8?Q?_annuel?=\n\
Content-Type: text/plain; charset=utf-8\n\
Content-Transfer-Encoding: base64\n\n\
SGVsbG8gd29ybGQ=\n";

        let doc = EmailLoader::new()
            .load_bytes(data, DocumentFormat::Email)
            .await
            .unwrap();

        assert_eq!(doc.text, "Hello world");
        assert_eq!(
            doc.metadata.get("subject").map(String::as_str),
            Some("Rapport annuel")
        );
    }

    #[tokio::test]
    async fn test_email_decodes_quoted_printable_part() {
        let data = b"Subject: x\nContent-Type: multipart/mixed; boundary=b2\n\n--b2\n\
Content-Type: text/plain; charset=\"iso-8859-1\"\n\
Content-Transfer-Encoding: quoted-printable\n\n\
caf=E9 soft=\nbreak\n--b2--\n";

        let doc = EmailLoader::new()
            .load_bytes(data, DocumentFormat::Email)
            .await
            .unwrap();

        assert_eq!(doc.text, "caf\u{e9} softbreak");
    }

    #[tokio::test]
    async fn test_email_rejects_invalid_utf8_and_missing_headers() {
        let loader = EmailLoader::new();

        let err = loader
            .load_bytes(b"Subject: x\n\n\xff\xfe", DocumentFormat::Email)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Encoding(_)));

        let err = loader
            .load_bytes(b"just a note", DocumentFormat::Email)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_html_title() {
        let loader = HtmlLoader::new();
        let doc = loader
            .load_bytes(
                b"<html><head><title> Policy </title></head><body>x</body></html>",
                DocumentFormat::Html,
            )
            .await
            .unwrap();

        assert_eq!(doc.metadata.get("title").map(String::as_str), Some("Policy"));
    }

    #[tokio::test]
    async fn test_composite_rejects_binary_formats() {
        let loader = CompositeLoader::default();
        assert!(!loader.can_load(DocumentFormat::Pdf));

        let err = loader
            .load_bytes(b"%PDF-1.7", DocumentFormat::Pdf)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn test_load_file_hashes_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "hello").unwrap();

        let doc = CompositeLoader::default().load_file(&path).await.unwrap();

        assert_eq!(doc.filename, "note.txt");
        assert_eq!(doc.content_hash, hash_bytes(b"hello"));
        assert_eq!(doc.content_hash.len(), 64);
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(DocumentFormat::from_extension("PDF"), Some(DocumentFormat::Pdf));
        assert_eq!(DocumentFormat::from_extension("eml"), Some(DocumentFormat::Email));
        assert_eq!(DocumentFormat::from_extension("unknown"), None);
    }
}
