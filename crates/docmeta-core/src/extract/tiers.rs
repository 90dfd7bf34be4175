use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::client::{ModelClient, ModelRequest, RawModelResponse, TransportError};
use super::output::{self, ParseFailure};
use super::schema::{ExtractionSchema, ParsedRecord};
use crate::error::{Error, Result};

/// Small-model-first calling policy for one pass. Only constructible through
/// [`TierPolicy::new`], so `fast_attempts` is always at least 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierPolicy {
    fast_model_id: String,
    fast_attempts: u32,
    fallback_enabled: bool,
    fallback_model_id: Option<String>,
}

impl TierPolicy {
    pub fn new(fast_model_id: impl Into<String>, fast_attempts: u32) -> Result<Self> {
        if fast_attempts == 0 {
            return Err(Error::Config("fast_attempts must be at least 1".into()));
        }
        Ok(Self {
            fast_model_id: fast_model_id.into(),
            fast_attempts,
            fallback_enabled: false,
            fallback_model_id: None,
        })
    }

    #[must_use]
    pub fn with_fallback(mut self, model_id: impl Into<String>) -> Self {
        self.fallback_enabled = true;
        self.fallback_model_id = Some(model_id.into());
        self
    }

    #[must_use]
    pub fn without_fallback(mut self) -> Self {
        self.fallback_enabled = false;
        self
    }

    pub fn fast_model_id(&self) -> &str {
        &self.fast_model_id
    }

    pub const fn fast_attempts(&self) -> u32 {
        self.fast_attempts
    }

    /// The fallback model, if the fallback tier is enabled.
    pub fn fallback_model(&self) -> Option<&str> {
        self.fallback_enabled
            .then_some(self.fallback_model_id.as_deref())
            .flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Fast,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Accepted,
    Rejected,
    TransportFailed,
}

/// Progress of one unit through the tiers. Attempt numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierState {
    FastAttempt(u32),
    Fallback,
    Succeeded,
    Failed,
}

impl TierState {
    pub const INITIAL: Self = Self::FastAttempt(1);

    #[must_use]
    pub fn advance(self, outcome: AttemptOutcome, policy: &TierPolicy) -> Self {
        match (self, outcome) {
            (Self::Succeeded | Self::Failed, _) => self,
            (_, AttemptOutcome::Accepted) => Self::Succeeded,
            (_, AttemptOutcome::TransportFailed) | (Self::Fallback, AttemptOutcome::Rejected) => {
                Self::Failed
            }
            (Self::FastAttempt(n), AttemptOutcome::Rejected) if n < policy.fast_attempts => {
                Self::FastAttempt(n + 1)
            }
            (Self::FastAttempt(_), AttemptOutcome::Rejected) => {
                if policy.fallback_model().is_some() {
                    Self::Fallback
                } else {
                    Self::Failed
                }
            }
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Tier and model for the next call, or `None` once terminal.
    pub fn next_call<'a>(&self, policy: &'a TierPolicy) -> Option<(Tier, &'a str)> {
        match self {
            Self::FastAttempt(_) => Some((Tier::Fast, policy.fast_model_id.as_str())),
            Self::Fallback => policy.fallback_model().map(|m| (Tier::Fallback, m)),
            Self::Succeeded | Self::Failed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Rejected(#[serde(serialize_with = "display")] ParseFailure),
    Transport(#[serde(serialize_with = "display")] TransportError),
    /// The unit's task panicked or was aborted before producing a result.
    Task(String),
}

fn display<T: fmt::Display, S: serde::Serializer>(value: &T, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_str(value)
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "rejected: {e}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Task(e) => write!(f, "task: {e}"),
        }
    }
}

/// Terminal failure of one unit after its tiers were exhausted. Recorded,
/// never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("extraction failed on {tier:?} tier: {reason}")]
pub struct ExtractionFailed {
    pub tier: Tier,
    pub reason: FailureReason,
    pub last_response: Option<RawModelResponse>,
}

/// Everything needed to run one (pass, unit) through the tiers.
pub struct UnitRequest<'a> {
    pub pass_name: &'a str,
    pub chunk_index: usize,
    pub system_prompt: &'a str,
    pub content: &'a str,
    pub schema: &'a ExtractionSchema,
    pub policy: &'a TierPolicy,
    pub temperature: f32,
    pub max_tokens: u32,
    pub call_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct UnitExecution {
    pub outcome: std::result::Result<ParsedRecord, ExtractionFailed>,
    pub model_calls: u32,
    pub tier: Tier,
}

pub async fn execute_unit(client: &dyn ModelClient, unit: &UnitRequest<'_>) -> UnitExecution {
    let mut state = TierState::INITIAL;
    let mut model_calls = 0;
    let mut last_response: Option<RawModelResponse> = None;

    while let Some((tier, model_id)) = state.next_call(unit.policy) {
        model_calls += 1;

        let request = ModelRequest {
            model_id: model_id.to_string(),
            system_prompt: unit.system_prompt.to_string(),
            content: unit.content.to_string(),
            temperature: unit.temperature,
            max_tokens: unit.max_tokens,
        };

        let result = tokio::time::timeout(unit.call_timeout, client.invoke(&request))
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Timeout {
                    model: model_id.to_string(),
                    after_secs: unit.call_timeout.as_secs(),
                })
            });

        let reason = match result {
            Ok(raw) => match output::parse(raw.as_str(), unit.schema) {
                Ok(record) => {
                    tracing::debug!(
                        pass = unit.pass_name,
                        chunk = unit.chunk_index,
                        model = model_id,
                        calls = model_calls,
                        "Unit extracted"
                    );
                    return UnitExecution {
                        outcome: Ok(record),
                        model_calls,
                        tier,
                    };
                }
                Err(failure) => {
                    tracing::warn!(
                        pass = unit.pass_name,
                        chunk = unit.chunk_index,
                        model = model_id,
                        ?state,
                        error = %failure,
                        "Model output rejected"
                    );
                    last_response = Some(raw);
                    state = state.advance(AttemptOutcome::Rejected, unit.policy);
                    FailureReason::Rejected(failure)
                }
            },
            Err(error) => {
                tracing::warn!(
                    pass = unit.pass_name,
                    chunk = unit.chunk_index,
                    model = model_id,
                    error = %error,
                    "Model call failed"
                );
                state = state.advance(AttemptOutcome::TransportFailed, unit.policy);
                FailureReason::Transport(error)
            }
        };

        if state == TierState::Failed {
            return UnitExecution {
                outcome: Err(ExtractionFailed {
                    tier,
                    reason,
                    last_response,
                }),
                model_calls,
                tier,
            };
        }

        if state == TierState::Fallback {
            tracing::info!(
                pass = unit.pass_name,
                chunk = unit.chunk_index,
                attempts = unit.policy.fast_attempts,
                "Fast tier exhausted, trying fallback model"
            );
        }
    }

    // `next_call` is only `None` in terminal states, both handled above.
    UnitExecution {
        outcome: Err(ExtractionFailed {
            tier: Tier::Fast,
            reason: FailureReason::Rejected(ParseFailure::NoJsonObject),
            last_response,
        }),
        model_calls,
        tier: Tier::Fast,
    }
}
