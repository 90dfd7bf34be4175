use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Failure talking to the model endpoint. Not retried by the tier loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request to {model} timed out after {after_secs}s")]
    Timeout { model: String, after_secs: u64 },
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("model '{0}' is not configured")]
    NotConfigured(String),
}

/// Untrusted model output text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawModelResponse(pub String);

impl RawModelResponse {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for RawModelResponse {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RawModelResponse {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRequest {
    pub model_id: String,
    pub system_prompt: String,
    pub content: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    async fn invoke(&self, request: &ModelRequest) -> std::result::Result<RawModelResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub enum AzureAuth {
    ApiKey(String),
    BearerToken(String),
}

#[derive(Debug, Clone)]
pub struct AzureOpenAiConfig {
    endpoint: Url,
    auth: AzureAuth,
    timeout: Duration,
    api_versions: HashMap<String, String>,
}

impl AzureOpenAiConfig {
    pub fn new(endpoint: &str, auth: AzureAuth) -> Result<Self> {
        let mut endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint '{endpoint}': {e}")))?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        Ok(Self {
            endpoint,
            auth,
            timeout: Duration::from_secs(120),
            api_versions: HashMap::new(),
        })
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_deployment(
        mut self,
        deployment: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        self.api_versions.insert(deployment.into(), api_version.into());
        self
    }

    pub fn api_version_for(&self, deployment: &str) -> Option<&str> {
        self.api_versions.get(deployment).map(String::as_str)
    }

    fn completions_url(&self, deployment: &str) -> std::result::Result<Url, TransportError> {
        let api_version = self
            .api_version_for(deployment)
            .ok_or_else(|| TransportError::NotConfigured(deployment.to_string()))?;

        let mut url = self
            .endpoint
            .join(&format!("openai/deployments/{deployment}/chat/completions"))
            .map_err(|e| TransportError::InvalidResponse(format!("bad deployment url: {e}")))?;
        url.query_pairs_mut().append_pair("api-version", api_version);
        Ok(url)
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Azure OpenAI chat-completions client. Deployment names are model ids.
pub struct AzureOpenAiClient {
    config: AzureOpenAiConfig,
    client: Client,
}

impl AzureOpenAiClient {
    pub fn new(config: AzureOpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        tracing::info!(endpoint = %config.endpoint, "Azure OpenAI client initialized");

        Ok(Self { config, client })
    }

    fn map_send_error(&self, model: &str, e: &reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                model: model.to_string(),
                after_secs: self.config.timeout.as_secs(),
            }
        } else if e.is_connect() {
            TransportError::Connection(format!("{}: {e}", self.config.endpoint))
        } else {
            TransportError::Connection(e.to_string())
        }
    }
}

#[async_trait::async_trait]
impl ModelClient for AzureOpenAiClient {
    async fn invoke(&self, request: &ModelRequest) -> std::result::Result<RawModelResponse, TransportError> {
        let url = self.config.completions_url(&request.model_id)?;

        let body = ChatCompletionRequest {
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.content,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let builder = self.client.post(url).json(&body);
        let builder = match &self.config.auth {
            AzureAuth::ApiKey(key) => builder.header("api-key", key),
            AzureAuth::BearerToken(token) => builder.bearer_auth(token),
        };

        tracing::debug!(model = %request.model_id, chars = request.content.len(), "Invoking model");

        let response = builder
            .send()
            .await
            .map_err(|e| self.map_send_error(&request.model_id, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(RawModelResponse)
            .ok_or_else(|| TransportError::InvalidResponse("response has no message content".into()))
    }
}
