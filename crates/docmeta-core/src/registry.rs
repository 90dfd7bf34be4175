use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use crate::cache::UnitCache;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::extract::{LlmPass, LlmPassPipeline, ModelClient};
use crate::pipeline::{LanguageTargets, Pipeline, PipelineBuilder};
use crate::references::{ReferenceExtractor, ReferenceExtractorRegistry};

/// Everything a family factory may draw on when assembling a pipeline.
#[derive(Clone)]
pub struct FactoryContext {
    pub settings: Arc<Settings>,
    pub language: String,
    pub client: Arc<dyn ModelClient>,
    /// Clients for languages a file name declares at run time.
    pub clients: ClientProvider,
    pub references: ReferenceExtractorRegistry,
    pub cache: Option<Arc<UnitCache>>,
}

impl FactoryContext {
    /// Builder with the client, language targets and unit cache already
    /// applied.
    pub fn builder(&self, family: &str) -> PipelineBuilder {
        let targets = LanguageTargets::new(Arc::clone(&self.settings), Arc::clone(&self.clients));
        let builder = Pipeline::builder(family, Arc::clone(&self.client))
            .language(&self.language)
            .language_targets(targets);
        match &self.cache {
            Some(cache) => builder.cache(Arc::clone(cache)),
            None => builder,
        }
    }

    /// Pass pipeline carrying the request settings.
    pub fn pass_pipeline(&self, passes: Vec<LlmPass>) -> LlmPassPipeline {
        LlmPassPipeline::new(passes)
            .with_max_concurrency(self.settings.max_concurrency)
            .with_temperature(self.settings.temperature)
            .with_max_tokens(self.settings.max_tokens)
            .with_call_timeout(self.settings.request_timeout)
    }
}

pub type FamilyFactory = Arc<dyn Fn(&FactoryContext) -> Result<Pipeline> + Send + Sync>;

/// Family name to pipeline factory, plus the named reference extractors.
/// Populated at startup and shared read-only afterwards.
#[derive(Clone, Default)]
pub struct Registry {
    families: BTreeMap<String, FamilyFactory>,
    references: ReferenceExtractorRegistry,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `generic` and `sop` families installed.
    pub fn with_builtin_plugins() -> Result<Self> {
        let mut registry = Self::new();
        crate::plugins::register_builtin(&mut registry)?;
        Ok(registry)
    }

    /// Binds `name`; a later registration replaces an earlier one.
    pub fn register_family<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&FactoryContext) -> Result<Pipeline> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.families.insert(name.clone(), Arc::new(factory)).is_some() {
            tracing::debug!(family = %name, "Replaced family factory");
        }
    }

    pub fn register_reference_extractor(
        &mut self,
        name: impl Into<String>,
        extractor: Arc<dyn ReferenceExtractor>,
    ) -> Option<Arc<dyn ReferenceExtractor>> {
        self.references.register(name, extractor)
    }

    pub const fn references(&self) -> &ReferenceExtractorRegistry {
        &self.references
    }

    pub fn families(&self) -> Vec<&str> {
        self.families.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, family: &str) -> bool {
        self.families.contains_key(family)
    }

    /// Context whose every language shares `client`.
    pub fn context(
        &self,
        settings: Arc<Settings>,
        language: impl Into<String>,
        client: Arc<dyn ModelClient>,
    ) -> FactoryContext {
        let shared = Arc::clone(&client);
        let clients: ClientProvider =
            Arc::new(move |_language: &str| -> Result<Arc<dyn ModelClient>> {
                Ok(Arc::clone(&shared))
            });

        FactoryContext {
            settings,
            language: language.into(),
            client,
            clients,
            references: self.references.clone(),
            cache: None,
        }
    }

    pub fn get_pipeline(&self, family: &str, context: &FactoryContext) -> Result<Pipeline> {
        let factory = self
            .families
            .get(family)
            .ok_or_else(|| Error::UnknownFamily(family.to_string()))?;
        factory(context)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("families", &self.families())
            .field("references", &self.references)
            .finish()
    }
}

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

/// Installs the process-wide registry. The first installation wins; the
/// installed registry is returned either way.
pub fn install(registry: Registry) -> Arc<Registry> {
    let installed = GLOBAL.get_or_init(|| Arc::new(registry));
    Arc::clone(installed)
}

pub fn global() -> Option<Arc<Registry>> {
    GLOBAL.get().cloned()
}

pub type ClientProvider = Arc<dyn Fn(&str) -> Result<Arc<dyn ModelClient>> + Send + Sync>;

/// Built pipelines keyed on `(family, language)`.
pub struct PipelineCache {
    registry: Arc<Registry>,
    settings: Arc<Settings>,
    clients: ClientProvider,
    unit_cache: Option<Arc<UnitCache>>,
    pipelines: Mutex<HashMap<(String, String), Arc<Pipeline>>>,
}

impl PipelineCache {
    pub fn new(registry: Arc<Registry>, settings: Arc<Settings>, clients: ClientProvider) -> Self {
        Self {
            registry,
            settings,
            clients,
            unit_cache: None,
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    /// Shares one unit cache across every pipeline built here.
    #[must_use]
    pub fn with_unit_cache(mut self, cache: Arc<UnitCache>) -> Self {
        self.unit_cache = Some(cache);
        self
    }

    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn get(&self, family: &str, language: &str) -> Result<Arc<Pipeline>> {
        let key = (family.to_string(), language.to_string());

        if let Some(pipeline) = self.lock().get(&key) {
            return Ok(Arc::clone(pipeline));
        }

        let client = (self.clients)(language)?;
        let mut context = self.registry.context(Arc::clone(&self.settings), language, client);
        context.clients = Arc::clone(&self.clients);
        context.cache.clone_from(&self.unit_cache);

        let pipeline = Arc::new(self.registry.get_pipeline(family, &context)?);
        tracing::debug!(family, language, "Cached pipeline");

        // A concurrent build of the same key keeps whichever landed first.
        let mut pipelines = self.lock();
        Ok(Arc::clone(pipelines.entry(key).or_insert(pipeline)))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Arc<Pipeline>>> {
        match self.pipelines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{ModelRequest, RawModelResponse, TransportError};
    use crate::postprocess::PostProcessor;
    use crate::references::RegexReferenceExtractor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Silent;

    #[async_trait::async_trait]
    impl ModelClient for Silent {
        async fn invoke(
            &self,
            _request: &ModelRequest,
        ) -> std::result::Result<RawModelResponse, TransportError> {
            Ok(RawModelResponse::from("{}"))
        }
    }

    fn minimal(context: &FactoryContext) -> Result<Pipeline> {
        context
            .builder("minimal")
            .post_processor(PostProcessor::new("ids", &context.references)?)
            .build()
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_reference_extractor(
            "ids",
            Arc::new(RegexReferenceExtractor::new(&[r"ID-\d+"]).unwrap()),
        );
        registry.register_family("minimal", minimal);
        registry
    }

    fn context(registry: &Registry) -> FactoryContext {
        registry.context(Arc::new(Settings::default()), "en", Arc::new(Silent))
    }

    #[test]
    fn test_unknown_family() {
        let registry = registry();
        let err = registry.get_pipeline("nope", &context(&registry)).err().unwrap();
        assert!(matches!(err, Error::UnknownFamily(name) if name == "nope"));
    }

    #[test]
    fn test_factory_receives_language() {
        let registry = registry();
        let mut ctx = context(&registry);
        ctx.language = "de".into();

        let pipeline = registry.get_pipeline("minimal", &ctx).unwrap();
        assert_eq!(pipeline.family(), "minimal");
        assert_eq!(pipeline.language(), "de");
    }

    #[test]
    fn test_later_family_registration_wins() {
        let mut registry = registry();
        registry.register_family("minimal", |_ctx: &FactoryContext| {
            Err(Error::Config("replaced".into()))
        });

        let err = registry.get_pipeline("minimal", &context(&registry)).err().unwrap();
        assert!(err.to_string().contains("replaced"));
        assert_eq!(registry.families(), vec!["minimal"]);
    }

    #[test]
    fn test_builtin_plugins_registered() {
        let registry = Registry::with_builtin_plugins().unwrap();
        assert_eq!(registry.families(), vec!["generic", "sop"]);
        assert!(registry.references().get("generic_refs").is_ok());
        assert!(registry.references().get("sop_ids").is_ok());
    }

    #[test]
    fn test_pipeline_cache_builds_once_per_key() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let provider: ClientProvider =
            Arc::new(move |_lang: &str| -> Result<Arc<dyn ModelClient>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(Silent))
            });

        let cache = PipelineCache::new(
            Arc::new(registry()),
            Arc::new(Settings::default()),
            provider,
        );

        let a = cache.get("minimal", "en").unwrap();
        let b = cache.get("minimal", "en").unwrap();
        let c = cache.get("minimal", "fr").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(c.language(), "fr");
        assert_eq!(cache.len(), 2);
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert!(cache.get("nope", "en").is_err());
    }
}
