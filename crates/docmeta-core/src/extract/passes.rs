use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::client::ModelClient;
use super::schema::{ExtractionSchema, ParsedRecord};
use super::tiers::{
    execute_unit, ExtractionFailed, FailureReason, Tier, TierPolicy, UnitExecution, UnitRequest,
};
use crate::cache::{Fingerprint, UnitCache};
use crate::ingest::Chunk;

/// One extraction prompt/schema pair with its tier policy.
#[derive(Debug, Clone)]
pub struct LlmPass {
    pub name: String,
    pub output_schema: Arc<ExtractionSchema>,
    pub system_prompt: String,
    pub tier_policy: TierPolicy,
}

impl LlmPass {
    pub fn new(
        name: impl Into<String>,
        output_schema: ExtractionSchema,
        system_prompt: impl Into<String>,
        tier_policy: TierPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            output_schema: Arc::new(output_schema),
            system_prompt: system_prompt.into(),
            tier_policy,
        }
    }

    /// The rendered prompt followed by the schema's field listing.
    pub fn system_prompt_for(&self, context: &PromptContext) -> String {
        format!(
            "{}\n\n{}",
            context.render(&self.system_prompt),
            self.output_schema.describe()
        )
    }
}

/// Values substituted into `{language}`, `{document_type}` and `{filename}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptContext {
    pub language: String,
    pub document_type: String,
    pub filename: String,
}

impl PromptContext {
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{language}", &self.language)
            .replace("{document_type}", &self.document_type)
            .replace("{filename}", &self.filename)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitGranularity {
    /// One unit per chunk.
    #[default]
    PerChunk,
    /// A single unit holding every chunk, reported as chunk 0.
    Document,
}

/// Outcome of one (pass, unit).
#[derive(Debug, Clone)]
pub struct PerChunkResult {
    pub chunk_index: usize,
    pub pass_name: String,
    pub model_calls: u32,
    pub tier: Tier,
    pub cached: bool,
    pub outcome: Result<ParsedRecord, ExtractionFailed>,
}

impl PerChunkResult {
    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Identifies a document for unit caching.
#[derive(Clone)]
pub struct CacheScope {
    pub cache: Arc<UnitCache>,
    pub content_hash: String,
    pub family: String,
    pub language: String,
}

/// Runs every pass over every unit, bounded by a semaphore.
#[derive(Debug, Clone)]
pub struct LlmPassPipeline {
    passes: Vec<Arc<LlmPass>>,
    granularity: UnitGranularity,
    max_concurrency: usize,
    temperature: f32,
    max_tokens: u32,
    call_timeout: Duration,
}

impl LlmPassPipeline {
    pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

    pub fn new(passes: Vec<LlmPass>) -> Self {
        Self {
            passes: passes.into_iter().map(Arc::new).collect(),
            granularity: UnitGranularity::default(),
            max_concurrency: Self::DEFAULT_MAX_CONCURRENCY,
            temperature: 0.0,
            max_tokens: 16_384,
            call_timeout: Duration::from_secs(120),
        }
    }

    #[must_use]
    pub const fn with_granularity(mut self, granularity: UnitGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub const fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// The same passes and request settings with every pass moved onto
    /// `policy`.
    #[must_use]
    pub fn with_tier_policy(&self, policy: &TierPolicy) -> Self {
        let passes = self
            .passes
            .iter()
            .map(|pass| {
                Arc::new(LlmPass {
                    tier_policy: policy.clone(),
                    ..LlmPass::clone(pass)
                })
            })
            .collect();
        Self {
            passes,
            ..self.clone()
        }
    }

    pub fn passes(&self) -> impl Iterator<Item = &LlmPass> {
        self.passes.iter().map(AsRef::as_ref)
    }

    pub const fn granularity(&self) -> UnitGranularity {
        self.granularity
    }

    pub fn units(&self, chunks: &[Chunk]) -> Vec<(usize, String)> {
        let units: Vec<(usize, String)> = match self.granularity {
            UnitGranularity::PerChunk => chunks.iter().map(|c| (c.index, c.text.clone())).collect(),
            UnitGranularity::Document => {
                let joined = chunks
                    .iter()
                    .map(|c| c.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                vec![(0, joined)]
            }
        };
        units
            .into_iter()
            .filter(|(_, text)| !text.trim().is_empty())
            .collect()
    }

    /// Results come back sorted by pass declaration order, then chunk index.
    /// Dropping the returned future aborts all in-flight units.
    pub async fn run(
        &self,
        client: Arc<dyn ModelClient>,
        chunks: &[Chunk],
        context: &PromptContext,
        cache: Option<&CacheScope>,
    ) -> Vec<PerChunkResult> {
        let units = self.units(chunks);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();

        let mut spawned: HashMap<tokio::task::Id, (String, usize)> = HashMap::new();

        for pass in &self.passes {
            let system_prompt: Arc<str> = pass.system_prompt_for(context).into();

            for (chunk_index, text) in &units {
                let unit = SpawnedUnit {
                    pass: Arc::clone(pass),
                    client: Arc::clone(&client),
                    semaphore: Arc::clone(&semaphore),
                    system_prompt: Arc::clone(&system_prompt),
                    content: text.clone(),
                    chunk_index: *chunk_index,
                    temperature: self.temperature,
                    max_tokens: self.max_tokens,
                    call_timeout: self.call_timeout,
                    cache: cache.cloned(),
                };
                let handle = tasks.spawn(unit.run());
                spawned.insert(handle.id(), (pass.name.clone(), *chunk_index));
            }
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, result)) => results.push(result),
                Err(e) => {
                    let Some((pass_name, chunk_index)) = spawned.remove(&e.id()) else {
                        tracing::error!(error = %e, "Unknown extraction unit task failed");
                        continue;
                    };
                    tracing::error!(
                        pass = %pass_name,
                        chunk = chunk_index,
                        error = %e,
                        "Extraction unit task failed"
                    );
                    results.push(PerChunkResult {
                        chunk_index,
                        pass_name,
                        model_calls: 0,
                        tier: Tier::Fast,
                        cached: false,
                        outcome: Err(ExtractionFailed {
                            tier: Tier::Fast,
                            reason: FailureReason::Task(e.to_string()),
                            last_response: None,
                        }),
                    });
                }
            }
        }

        let order: HashMap<&str, usize> = self
            .passes
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.as_str(), i))
            .collect();
        results.sort_by_key(|r| (order.get(r.pass_name.as_str()).copied(), r.chunk_index));
        results
    }
}

struct SpawnedUnit {
    pass: Arc<LlmPass>,
    client: Arc<dyn ModelClient>,
    semaphore: Arc<Semaphore>,
    system_prompt: Arc<str>,
    content: String,
    chunk_index: usize,
    temperature: f32,
    max_tokens: u32,
    call_timeout: Duration,
    cache: Option<CacheScope>,
}

impl SpawnedUnit {
    async fn run(self) -> PerChunkResult {
        let _permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();

        let request = UnitRequest {
            pass_name: &self.pass.name,
            chunk_index: self.chunk_index,
            system_prompt: &self.system_prompt,
            content: &self.content,
            schema: &self.pass.output_schema,
            policy: &self.pass.tier_policy,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            call_timeout: self.call_timeout,
        };

        let (execution, cached) = match &self.cache {
            Some(scope) => {
                let key = Fingerprint::new(
                    &scope.content_hash,
                    &scope.family,
                    &scope.language,
                    &self.pass.name,
                    self.chunk_index,
                );
                scope
                    .cache
                    .get_or_compute(key, || execute_unit(self.client.as_ref(), &request))
                    .await
            }
            None => (execute_unit(self.client.as_ref(), &request).await, false),
        };

        let UnitExecution {
            outcome,
            model_calls,
            tier,
        } = execution;

        PerChunkResult {
            chunk_index: self.chunk_index,
            pass_name: self.pass.name.clone(),
            model_calls,
            tier,
            cached,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{FieldSpec, FieldType, ModelRequest, RawModelResponse, TransportError};
    use crate::ingest::SourceLocator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes the unit text back as the `title` field, tracking peak concurrency.
    #[derive(Default)]
    struct Echo {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ModelClient for Echo {
        async fn invoke(&self, request: &ModelRequest) -> Result<RawModelResponse, TransportError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(RawModelResponse(
                serde_json::json!({ "title": request.content }).to_string(),
            ))
        }
    }

    fn pass(name: &str) -> LlmPass {
        LlmPass::new(
            name,
            ExtractionSchema::new(name).with_field(FieldSpec::required("title", FieldType::String)),
            "Extract from {filename} in {language}.",
            TierPolicy::new("small", 1).unwrap(),
        )
    }

    fn chunks(n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| Chunk::new(i, format!("chunk {i}"), SourceLocator::Whole))
            .collect()
    }

    #[test]
    fn test_prompt_rendering() {
        let context = PromptContext {
            language: "en".into(),
            document_type: "sop".into(),
            filename: "a.pdf".into(),
        };
        let prompt = pass("p").system_prompt_for(&context);

        assert!(prompt.starts_with("Extract from a.pdf in en."));
        assert!(prompt.contains("\"title\" (string, required)"));
    }

    #[test]
    fn test_document_granularity_joins_chunks() {
        let pipeline = LlmPassPipeline::new(vec![pass("p")]).with_granularity(UnitGranularity::Document);
        let units = pipeline.units(&chunks(2));

        assert_eq!(units, vec![(0, "chunk 0\n\nchunk 1".to_string())]);
    }

    #[test]
    fn test_blank_units_are_skipped() {
        let pipeline = LlmPassPipeline::new(vec![pass("p")]);
        let mut input = chunks(2);
        input[1].text = "  \n".into();

        assert_eq!(pipeline.units(&input).len(), 1);
    }

    #[test]
    fn test_tier_policy_retarget_keeps_settings() {
        let pipeline = LlmPassPipeline::new(vec![pass("a"), pass("b")]).with_max_concurrency(2);
        let french = TierPolicy::new("small-fr", 2).unwrap();

        let moved = pipeline.with_tier_policy(&french);

        assert!(moved.passes().all(|p| p.tier_policy == french));
        assert_eq!(moved.max_concurrency, 2);
        assert!(pipeline.passes().all(|p| p.tier_policy.fast_model_id() == "small"));
    }

    #[tokio::test]
    async fn test_results_sorted_and_bounded() {
        let client = Arc::new(Echo::default());
        let pipeline = LlmPassPipeline::new(vec![pass("first"), pass("second")]).with_max_concurrency(2);

        let results = pipeline
            .run(client.clone(), &chunks(5), &PromptContext::default(), None)
            .await;

        assert_eq!(results.len(), 10);
        let keys: Vec<(&str, usize)> = results
            .iter()
            .map(|r| (r.pass_name.as_str(), r.chunk_index))
            .collect();
        assert_eq!(keys[0], ("first", 0));
        assert_eq!(keys[4], ("first", 4));
        assert_eq!(keys[5], ("second", 0));
        assert!(client.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(
            results[3].outcome.as_ref().unwrap().fields["title"],
            "chunk 3"
        );
    }

    /// Panics on the second chunk.
    struct Faulty;

    #[async_trait::async_trait]
    impl ModelClient for Faulty {
        async fn invoke(&self, request: &ModelRequest) -> Result<RawModelResponse, TransportError> {
            assert_ne!(request.content, "chunk 1", "model client crashed");
            Ok(RawModelResponse(
                serde_json::json!({ "title": request.content }).to_string(),
            ))
        }
    }

    #[tokio::test]
    async fn test_panicked_unit_recorded_as_failure() {
        let pipeline = LlmPassPipeline::new(vec![pass("p")]);

        let results = pipeline
            .run(Arc::new(Faulty), &chunks(3), &PromptContext::default(), None)
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_success());
        assert!(results[2].is_success());

        let crashed = &results[1];
        assert_eq!((crashed.pass_name.as_str(), crashed.chunk_index), ("p", 1));
        assert_eq!(crashed.model_calls, 0);
        let failed = crashed.outcome.as_ref().unwrap_err();
        assert!(matches!(failed.reason, FailureReason::Task(_)));
        assert!(failed.to_string().contains("task:"));
    }
}
