use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::extract::{AzureAuth, AzureOpenAiConfig, TierPolicy};

pub const ENDPOINT_VAR: &str = "AZURE_OPENAI_ENDPOINT";
pub const API_KEY_VAR: &str = "AZURE_OPENAI_KEY";
pub const AD_TOKEN_VAR: &str = "AZURE_OPENAI_AD_TOKEN";
pub const FAST_MODEL_VAR: &str = "AZURE_OPENAI_SLM";
pub const FAST_VERSION_VAR: &str = "AZURE_OPENAI_SLM_API_VERSION";
pub const FALLBACK_MODEL_VAR: &str = "AZURE_OPENAI_LLM";
pub const FALLBACK_VERSION_VAR: &str = "AZURE_OPENAI_LLM_API_VERSION";

/// Text cleaning defaults shared by the built-in families.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningConfig {
    pub patterns_to_remove: Vec<String>,
    pub doc_no_regex: String,
    pub version_regex: String,
    pub uncontrolled_copy_regex: String,
    /// Minimum length for a line to count as a running header/footer candidate.
    pub length_threshold: usize,
    /// Minimum repetitions before such a line is dropped.
    pub frequency_threshold: usize,
    pub selection_mappings: BTreeMap<String, String>,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            patterns_to_remove: vec![
                r"<figure>.*?</figure>".into(),
                r#"<!-- PageFooter=".*?" -->"#.into(),
                r#"<!-- PageHeader=".*?" -->"#.into(),
            ],
            doc_no_regex: r"Doc No\. : \w{3}-\d+".into(),
            version_regex: r"Version : \d+\.\d+".into(),
            uncontrolled_copy_regex: "Uncontrolled Copy".into(),
            length_threshold: 10,
            frequency_threshold: 10,
            selection_mappings: BTreeMap::from([
                (":selected:".into(), "☒".into()),
                (":unselected:".into(), "☐".into()),
            ]),
        }
    }
}

/// A concrete deployment to call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTarget {
    pub deployment: String,
    pub api_version: String,
}

/// One model tier. Per-language overrides apply only when both the
/// deployment and the API version are overridden for that language.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub deployment: Option<String>,
    pub api_version: Option<String>,
    pub by_language: BTreeMap<String, ModelTarget>,
}

impl ModelSettings {
    fn from_vars(vars: &HashMap<String, String>, model_var: &str, version_var: &str) -> Self {
        let prefix = format!("{model_var}_");
        let version_suffix = version_var.strip_prefix(&prefix).unwrap_or(version_var);

        let by_language = vars
            .iter()
            .filter_map(|(key, deployment)| {
                let lang = key.strip_prefix(&prefix)?;
                if lang.is_empty() || lang.starts_with(version_suffix) {
                    return None;
                }
                let api_version = non_empty(vars.get(&format!("{version_var}_{lang}")))?;
                let deployment = non_empty(Some(deployment))?;
                Some((
                    lang.to_uppercase(),
                    ModelTarget {
                        deployment,
                        api_version,
                    },
                ))
            })
            .collect();

        Self {
            deployment: non_empty(vars.get(model_var)),
            api_version: non_empty(vars.get(version_var)),
            by_language,
        }
    }

    pub fn resolve(&self, language: &str) -> Option<ModelTarget> {
        if let Some(target) = self.by_language.get(&language.to_uppercase()) {
            return Some(target.clone());
        }
        Some(ModelTarget {
            deployment: self.deployment.clone()?,
            api_version: self.api_version.clone()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(skip_serializing)]
    pub ad_token: Option<String>,
    pub fast_model: ModelSettings,
    pub fallback_model: ModelSettings,
    pub fast_attempts: u32,
    pub enable_fallback: bool,
    pub default_language: String,
    pub max_concurrency: usize,
    pub request_timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
    pub cleaning: CleaningConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            ad_token: None,
            fast_model: ModelSettings::default(),
            fallback_model: ModelSettings::default(),
            fast_attempts: 3,
            enable_fallback: false,
            default_language: "en".into(),
            max_concurrency: 4,
            request_timeout: Duration::from_secs(120),
            max_tokens: 16_384,
            temperature: 0.0,
            cleaning: CleaningConfig::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let defaults = Self::default();

        let fast_attempts = parse_var(&vars, "SLM_EXTRACTION_ATTEMPTS", defaults.fast_attempts)?;
        if fast_attempts == 0 {
            return Err(Error::Config(
                "SLM_EXTRACTION_ATTEMPTS must be at least 1".into(),
            ));
        }

        let max_concurrency =
            parse_var(&vars, "DOCMETA_MAX_CONCURRENCY", defaults.max_concurrency)?.max(1);
        let timeout_secs = parse_var(
            &vars,
            "DOCMETA_REQUEST_TIMEOUT_SECS",
            defaults.request_timeout.as_secs(),
        )?;

        Ok(Self {
            endpoint: non_empty(vars.get(ENDPOINT_VAR)),
            api_key: non_empty(vars.get(API_KEY_VAR)),
            ad_token: non_empty(vars.get(AD_TOKEN_VAR)),
            fast_model: ModelSettings::from_vars(&vars, FAST_MODEL_VAR, FAST_VERSION_VAR),
            fallback_model: ModelSettings::from_vars(
                &vars,
                FALLBACK_MODEL_VAR,
                FALLBACK_VERSION_VAR,
            ),
            fast_attempts,
            enable_fallback: vars
                .get("ENABLE_LLM")
                .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
            default_language: non_empty(vars.get("DEFAULT_LANGUAGE"))
                .unwrap_or(defaults.default_language),
            max_concurrency,
            request_timeout: Duration::from_secs(timeout_secs),
            max_tokens: parse_var(&vars, "DOCMETA_MAX_TOKENS", defaults.max_tokens)?,
            temperature: defaults.temperature,
            cleaning: defaults.cleaning,
        })
    }

    /// Resolves the fast/fallback tiers for `language`. A missing fast model
    /// is an error; a missing fallback model disables the fallback tier.
    pub fn tier_policy(&self, language: &str) -> Result<TierPolicy> {
        let fast = self.fast_model.resolve(language).ok_or_else(|| {
            Error::Config(format!(
                "{FAST_MODEL_VAR} and {FAST_VERSION_VAR} must be set (language {language})"
            ))
        })?;

        let mut policy = TierPolicy::new(fast.deployment, self.fast_attempts)?;

        if self.enable_fallback {
            match self.fallback_model.resolve(language) {
                Some(target) => policy = policy.with_fallback(target.deployment),
                None => tracing::warn!(
                    language,
                    "ENABLE_LLM is set but {FALLBACK_MODEL_VAR}/{FALLBACK_VERSION_VAR} are not; \
                     fallback tier disabled"
                ),
            }
        }

        Ok(policy)
    }

    pub fn client_config(&self, language: &str) -> Result<AzureOpenAiConfig> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| Error::Config(format!("{ENDPOINT_VAR} must be set")))?;

        let auth = match (&self.api_key, &self.ad_token) {
            (Some(key), _) => AzureAuth::ApiKey(key.clone()),
            (None, Some(token)) => AzureAuth::BearerToken(token.clone()),
            (None, None) => {
                return Err(Error::Config(format!(
                    "either {API_KEY_VAR} or {AD_TOKEN_VAR} must be set"
                )))
            }
        };

        let mut config = AzureOpenAiConfig::new(&endpoint, auth)?
            .with_timeout(self.request_timeout);

        for target in [
            self.fast_model.resolve(language),
            self.fallback_model.resolve(language),
        ]
        .into_iter()
        .flatten()
        {
            config = config.with_deployment(target.deployment, target.api_version);
        }

        Ok(config)
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(String::from)
}

fn parse_var<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(vars.get(key)) {
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("{key}={raw}: {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Settings {
        Settings::from_vars(pairs.iter().map(|(k, v)| (*k, *v))).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = vars(&[]);

        assert_eq!(settings.fast_attempts, 3);
        assert!(!settings.enable_fallback);
        assert_eq!(settings.default_language, "en");
        assert_eq!(settings.max_concurrency, 4);
        assert_eq!(settings.request_timeout, Duration::from_secs(120));
        assert_eq!(settings.max_tokens, 16_384);
    }

    #[test]
    fn test_reads_tier_settings() {
        let settings = vars(&[
            ("SLM_EXTRACTION_ATTEMPTS", "2"),
            ("ENABLE_LLM", "True"),
            ("AZURE_OPENAI_SLM", "gpt-4o-mini"),
            ("AZURE_OPENAI_SLM_API_VERSION", "2024-08-01-preview"),
            ("AZURE_OPENAI_LLM", "gpt-4o"),
            ("AZURE_OPENAI_LLM_API_VERSION", "2024-08-01-preview"),
        ]);

        let policy = settings.tier_policy("en").unwrap();
        assert_eq!(policy.fast_model_id(), "gpt-4o-mini");
        assert_eq!(policy.fast_attempts(), 2);
        assert_eq!(policy.fallback_model(), Some("gpt-4o"));
    }

    #[test]
    fn test_language_override_needs_both_vars() {
        let settings = vars(&[
            ("AZURE_OPENAI_SLM", "base"),
            ("AZURE_OPENAI_SLM_API_VERSION", "v1"),
            ("AZURE_OPENAI_SLM_DE", "german"),
            ("AZURE_OPENAI_SLM_API_VERSION_DE", "v2"),
            ("AZURE_OPENAI_SLM_FR", "french-without-version"),
        ]);

        let de = settings.fast_model.resolve("de").unwrap();
        assert_eq!(de.deployment, "german");
        assert_eq!(de.api_version, "v2");

        let fr = settings.fast_model.resolve("fr").unwrap();
        assert_eq!(fr.deployment, "base");
        assert!(!settings.fast_model.by_language.contains_key("API_VERSION"));
    }

    #[test]
    fn test_missing_fast_model_is_config_error() {
        let err = vars(&[]).tier_policy("en").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_fallback_without_model_is_disabled() {
        let settings = vars(&[
            ("ENABLE_LLM", "true"),
            ("AZURE_OPENAI_SLM", "small"),
            ("AZURE_OPENAI_SLM_API_VERSION", "v1"),
        ]);

        let policy = settings.tier_policy("en").unwrap();
        assert_eq!(policy.fallback_model(), None);
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let err = Settings::from_vars([("DOCMETA_MAX_TOKENS", "lots")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Settings::from_vars([("SLM_EXTRACTION_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_client_config_requires_credentials() {
        let settings = vars(&[("AZURE_OPENAI_ENDPOINT", "https://example.openai.azure.com")]);
        assert!(matches!(
            settings.client_config("en").unwrap_err(),
            Error::Config(_)
        ));

        let settings = vars(&[
            ("AZURE_OPENAI_ENDPOINT", "https://example.openai.azure.com"),
            ("AZURE_OPENAI_KEY", "secret"),
            ("AZURE_OPENAI_SLM", "small"),
            ("AZURE_OPENAI_SLM_API_VERSION", "v1"),
        ]);
        let config = settings.client_config("en").unwrap();
        assert_eq!(config.api_version_for("small"), Some("v1"));
    }
}
