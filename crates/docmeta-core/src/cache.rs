use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::extract::{ExtractionFailed, FailureReason, ParseFailure, ParsedRecord, Tier, UnitExecution};

/// Stable identity of one unit of extraction work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub content_hash: String,
    pub family: String,
    pub language: String,
    pub pass_name: String,
    pub chunk_index: usize,
}

impl Fingerprint {
    pub fn new(
        content_hash: &str,
        family: &str,
        language: &str,
        pass_name: &str,
        chunk_index: usize,
    ) -> Self {
        Self {
            content_hash: content_hash.to_string(),
            family: family.to_string(),
            language: language.to_string(),
            pass_name: pass_name.to_string(),
            chunk_index,
        }
    }
}

type Slot = Arc<OnceCell<(ParsedRecord, Tier)>>;

/// Cross-run cache of successful unit extractions.
///
/// Concurrent requests for the same fingerprint share one computation;
/// failures are not cached, so a later run retries them.
#[derive(Default)]
pub struct UnitCache {
    slots: Mutex<HashMap<Fingerprint, Slot>>,
}

impl UnitCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| slots.values().filter(|s| s.initialized()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: Fingerprint) -> Slot {
        match self.slots.lock() {
            Ok(mut slots) => Arc::clone(slots.entry(key).or_default()),
            Err(poisoned) => Arc::clone(poisoned.into_inner().entry(key).or_default()),
        }
    }

    /// Returns the execution and whether it came from the cache. A cache hit
    /// reports zero model calls.
    pub async fn get_or_compute<F, Fut>(&self, key: Fingerprint, compute: F) -> (UnitExecution, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = UnitExecution>,
    {
        let slot = self.slot(key);
        let mut computed: Option<UnitExecution> = None;

        let result = slot
            .get_or_try_init(|| async {
                let execution = compute().await;
                let stored = match &execution.outcome {
                    Ok(record) => Ok((record.clone(), execution.tier)),
                    Err(_) => Err(()),
                };
                computed = Some(execution);
                stored
            })
            .await;

        match (computed, result) {
            (Some(execution), _) => (execution, false),
            (None, Ok((record, tier))) => (
                UnitExecution {
                    outcome: Ok(record.clone()),
                    model_calls: 0,
                    tier: *tier,
                },
                true,
            ),
            // Only reachable if the initializer failed without running, which
            // `get_or_try_init` never does.
            (None, Err(())) => (
                UnitExecution {
                    outcome: Err(ExtractionFailed {
                        tier: Tier::Fast,
                        reason: FailureReason::Rejected(ParseFailure::NoJsonObject),
                        last_response: None,
                    }),
                    model_calls: 0,
                    tier: Tier::Fast,
                },
                false,
            ),
        }
    }
}
