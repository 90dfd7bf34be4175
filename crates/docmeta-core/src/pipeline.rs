use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::cache::UnitCache;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::extract::{CacheScope, LlmPassPipeline, ModelClient, PromptContext};
use crate::fallback::FallbackExtractor;
use crate::filename::{FilenameParser, NoSeeds, SeedFields};
use crate::ingest::{Chunker, CleaningPipeline};
use crate::mapping::{SchemaMap, SchemaMapper};
use crate::postprocess::{PostProcessor, UnitFailure};
use crate::registry::ClientProvider;

/// Fields every run can supply without a model.
pub const BUILTIN_FIELDS: &[&str] = &[
    "filename",
    "document_id",
    "content_hash",
    "family",
    "references",
    "extracted_at",
    "language",
];

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Caller-supplied values that override both seeds and model output.
    pub external_fields: Map<String, Value>,
    /// Whole-run deadline; in-flight model calls are dropped when it passes.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_external(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.external_fields.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunDiagnostics {
    pub family: String,
    pub document_id: String,
    pub language: String,
    pub chunks: usize,
    pub units: usize,
    pub model_calls: u32,
    pub cached_units: usize,
    pub failed_units: Vec<UnitFailure>,
    /// Set when every pass came back empty and the family's fallback
    /// extractor supplied the model-level fields instead.
    pub fallback_used: bool,
    pub missing_fields: Vec<String>,
    pub reference_count: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionOutput {
    pub metadata: Map<String, Value>,
    pub diagnostics: RunDiagnostics,
}

type Binding = (Arc<dyn ModelClient>, Arc<LlmPassPipeline>);

/// Rebinds the model client and tier policies when a file name declares a
/// language other than the pipeline's own. Bindings are built once per
/// language.
pub struct LanguageTargets {
    settings: Arc<Settings>,
    clients: ClientProvider,
    bound: Mutex<HashMap<String, Binding>>,
}

impl LanguageTargets {
    pub fn new(settings: Arc<Settings>, clients: ClientProvider) -> Self {
        Self {
            settings,
            clients,
            bound: Mutex::new(HashMap::new()),
        }
    }

    fn bind(&self, language: &str, passes: &LlmPassPipeline) -> Result<Binding> {
        let mut bound = match self.bound.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((client, passes)) = bound.get(language) {
            return Ok((Arc::clone(client), Arc::clone(passes)));
        }

        let policy = self.settings.tier_policy(language)?;
        let client = (self.clients)(language)?;
        tracing::debug!(language, model = policy.fast_model_id(), "Bound language target");

        let binding = (client, Arc::new(passes.with_tier_policy(&policy)));
        bound.insert(language.to_string(), binding.clone());
        Ok(binding)
    }
}

/// One family's complete extraction pipeline. Holds no per-run state, so
/// concurrent `run` calls on different files are independent.
pub struct Pipeline {
    family: String,
    language: String,
    document_type: String,
    chunker: Chunker,
    cleaning: CleaningPipeline,
    passes: LlmPassPipeline,
    post_processor: PostProcessor,
    mapper: SchemaMapper,
    filename_parser: Box<dyn FilenameParser>,
    fallback: Option<Box<dyn FallbackExtractor>>,
    client: Arc<dyn ModelClient>,
    targets: Option<LanguageTargets>,
    cache: Option<Arc<UnitCache>>,
}

impl Pipeline {
    pub fn builder(family: impl Into<String>, client: Arc<dyn ModelClient>) -> PipelineBuilder {
        PipelineBuilder::new(family, client)
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub const fn passes(&self) -> &LlmPassPipeline {
        &self.passes
    }

    pub const fn cleaning(&self) -> &CleaningPipeline {
        &self.cleaning
    }

    pub const fn mapper(&self) -> &SchemaMapper {
        &self.mapper
    }

    pub async fn run(&self, path: &Path) -> Result<ExtractionOutput> {
        self.run_with(path, RunOptions::default()).await
    }

    pub async fn run_with(&self, path: &Path, options: RunOptions) -> Result<ExtractionOutput> {
        let RunOptions {
            external_fields,
            timeout,
        } = options;

        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.execute(path, &external_fields))
                .await
                .map_err(|_| {
                    tracing::warn!(path = %path.display(), ?limit, "Run cancelled");
                    Error::Cancelled(limit)
                })?,
            None => self.execute(path, &external_fields).await,
        }
    }

    async fn execute(&self, path: &Path, external: &Map<String, Value>) -> Result<ExtractionOutput> {
        let start = Instant::now();

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let seeds = self.filename_parser.parse(&filename);

        let language = seeds
            .get("language")
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| self.language.clone());

        let bound = match &self.targets {
            Some(targets) if !language.eq_ignore_ascii_case(&self.language) => {
                Some(targets.bind(&language, &self.passes)?)
            }
            _ => None,
        };
        let (client, passes): (Arc<dyn ModelClient>, &LlmPassPipeline) = match &bound {
            Some((client, passes)) => (Arc::clone(client), Arc::as_ref(passes)),
            None => (Arc::clone(&self.client), &self.passes),
        };

        let chunked = self.chunker.chunk_file(path).await?;
        let document = chunked.document;
        let chunks = self.cleaning.clean_chunks(&chunked.chunks);

        let full_text = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let context = PromptContext {
            language: language.clone(),
            document_type: seeds
                .get("document_type")
                .cloned()
                .unwrap_or_else(|| self.document_type.clone()),
            filename: filename.clone(),
        };

        let scope = self.cache.as_ref().map(|cache| CacheScope {
            cache: Arc::clone(cache),
            content_hash: document.content_hash.clone(),
            family: self.family.clone(),
            language: language.clone(),
        });

        let results = passes.run(client, &chunks, &context, scope.as_ref()).await;

        let merged = self
            .post_processor
            .merge(&results, passes.passes(), &full_text);

        let recovered = match &self.fallback {
            Some(fallback) if merged.has_no_fields() => {
                let recovered = fallback.extract(&document, &full_text);
                tracing::warn!(
                    file = %filename,
                    fallback = fallback.name(),
                    recovered = recovered.as_ref().map_or(0, Map::len),
                    "No pass produced a field; used fallback extractor"
                );
                recovered
            }
            _ => None,
        };

        let mut internal =
            self.builtin_fields(&document.id, &document.content_hash, &filename, &language);
        internal.insert(
            "references".into(),
            Value::Array(merged.references.iter().cloned().map(Value::String).collect()),
        );
        overlay(&mut internal, merged.flatten());
        let fallback_used = recovered.is_some();
        if let Some(fields) = recovered {
            overlay(&mut internal, fields);
        }
        overlay_seeds(&mut internal, &seeds);
        overlay(&mut internal, external.clone());

        let missing_fields = self.mapper.missing_fields(&internal);
        let metadata = self.mapper.map(&internal)?;

        let diagnostics = RunDiagnostics {
            family: self.family.clone(),
            document_id: document.id.to_string(),
            language,
            chunks: chunks.len(),
            units: results.len(),
            model_calls: results.iter().map(|r| r.model_calls).sum(),
            cached_units: results.iter().filter(|r| r.cached).count(),
            failed_units: merged.failures,
            fallback_used,
            missing_fields,
            reference_count: merged.references.len(),
            elapsed_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        tracing::info!(
            file = %filename,
            family = %self.family,
            language = %diagnostics.language,
            chunks = diagnostics.chunks,
            model_calls = diagnostics.model_calls,
            failed_units = diagnostics.failed_units.len(),
            missing = diagnostics.missing_fields.len(),
            elapsed_ms = diagnostics.elapsed_ms,
            "Extraction complete"
        );

        Ok(ExtractionOutput {
            metadata,
            diagnostics,
        })
    }

    fn builtin_fields(
        &self,
        id: &Uuid,
        content_hash: &str,
        filename: &str,
        language: &str,
    ) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("filename".into(), filename.into());
        fields.insert("document_id".into(), id.to_string().into());
        fields.insert("content_hash".into(), content_hash.into());
        fields.insert("family".into(), self.family.clone().into());
        fields.insert("extracted_at".into(), chrono::Utc::now().to_rfc3339().into());
        fields.insert("language".into(), language.into());
        fields
    }
}

fn overlay(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (name, value) in source {
        if !value.is_null() {
            target.insert(name, value);
        }
    }
}

/// Empty seeds are skipped so the model's value survives.
fn overlay_seeds(target: &mut Map<String, Value>, seeds: &SeedFields) {
    for (name, value) in seeds {
        if !value.trim().is_empty() {
            target.insert(name.clone(), Value::String(value.clone()));
        }
    }
}

pub struct PipelineBuilder {
    family: String,
    client: Arc<dyn ModelClient>,
    language: String,
    document_type: Option<String>,
    chunker: Chunker,
    cleaning: CleaningPipeline,
    passes: LlmPassPipeline,
    post_processor: Option<PostProcessor>,
    schema_map: SchemaMap,
    filename_parser: Box<dyn FilenameParser>,
    fallback: Option<Box<dyn FallbackExtractor>>,
    external_fields: Vec<String>,
    targets: Option<LanguageTargets>,
    cache: Option<Arc<UnitCache>>,
}

impl PipelineBuilder {
    pub fn new(family: impl Into<String>, client: Arc<dyn ModelClient>) -> Self {
        Self {
            family: family.into(),
            client,
            language: "en".into(),
            document_type: None,
            chunker: Chunker::default(),
            cleaning: CleaningPipeline::new(),
            passes: LlmPassPipeline::new(Vec::new()),
            post_processor: None,
            schema_map: SchemaMap::new(),
            filename_parser: Box::new(NoSeeds),
            fallback: None,
            external_fields: Vec::new(),
            targets: None,
            cache: None,
        }
    }

    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Fallback for the `{document_type}` prompt placeholder when the file
    /// name does not seed one. Defaults to the family name.
    #[must_use]
    pub fn document_type(mut self, document_type: impl Into<String>) -> Self {
        self.document_type = Some(document_type.into());
        self
    }

    #[must_use]
    pub fn chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = chunker;
        self
    }

    #[must_use]
    pub fn cleaning(mut self, cleaning: CleaningPipeline) -> Self {
        self.cleaning = cleaning;
        self
    }

    #[must_use]
    pub fn passes(mut self, passes: LlmPassPipeline) -> Self {
        self.passes = passes;
        self
    }

    #[must_use]
    pub fn post_processor(mut self, post_processor: PostProcessor) -> Self {
        self.post_processor = Some(post_processor);
        self
    }

    #[must_use]
    pub fn schema_map(mut self, schema_map: SchemaMap) -> Self {
        self.schema_map = schema_map;
        self
    }

    #[must_use]
    pub fn filename_parser(mut self, parser: Box<dyn FilenameParser>) -> Self {
        self.filename_parser = parser;
        self
    }

    /// Consulted only when no pass produced a single non-empty field.
    #[must_use]
    pub fn fallback(mut self, fallback: Box<dyn FallbackExtractor>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Lets a file name's language seed switch the model client and tier
    /// policies for that run. Without targets the pipeline's own client and
    /// passes serve every language.
    #[must_use]
    pub fn language_targets(mut self, targets: LanguageTargets) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Names callers may supply through [`RunOptions::external_fields`].
    #[must_use]
    pub fn external_fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.external_fields.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: Arc<UnitCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validates the whole assembly. Fails before any model call is possible.
    pub fn build(self) -> Result<Pipeline> {
        let post_processor = self.post_processor.ok_or_else(|| {
            Error::Config(format!("family '{}' has no post-processor", self.family))
        })?;

        let mut names = HashSet::new();
        for pass in self.passes.passes() {
            if !names.insert(pass.name.as_str()) {
                return Err(Error::Config(format!(
                    "family '{}' declares pass '{}' twice",
                    self.family, pass.name
                )));
            }
        }

        let mapper = SchemaMapper::new(self.schema_map)?;

        let mut producible: BTreeSet<String> =
            BUILTIN_FIELDS.iter().map(|f| (*f).to_string()).collect();
        for pass in self.passes.passes() {
            producible.extend(pass.output_schema.field_names().map(String::from));
        }
        producible.extend(
            self.filename_parser
                .provided_fields()
                .iter()
                .map(|f| (*f).to_string()),
        );
        if let Some(fallback) = &self.fallback {
            producible.extend(fallback.provided_fields());
        }
        producible.extend(self.external_fields.iter().cloned());
        mapper.validate_sources(&producible)?;

        tracing::debug!(
            family = %self.family,
            language = %self.language,
            passes = names.len(),
            chunker = self.chunker.strategy_name(),
            cleaning = ?self.cleaning.step_names(),
            "Pipeline built"
        );

        let document_type = self.document_type.unwrap_or_else(|| self.family.clone());

        Ok(Pipeline {
            family: self.family,
            language: self.language,
            document_type,
            chunker: self.chunker,
            cleaning: self.cleaning,
            passes: self.passes,
            post_processor,
            mapper,
            filename_parser: self.filename_parser,
            fallback: self.fallback,
            client: self.client,
            targets: self.targets,
            cache: self.cache,
        })
    }
}
