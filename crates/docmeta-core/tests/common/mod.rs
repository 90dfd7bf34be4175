#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docmeta_core::{ModelClient, ModelRequest, RawModelResponse, TransportError};
use tempfile::TempDir;

type Reply = Result<RawModelResponse, TransportError>;

/// Answers every request through a closure and records the models and
/// system prompts it was called with.
pub struct StubClient {
    respond: Box<dyn Fn(&ModelRequest) -> Reply + Send + Sync>,
    calls: AtomicUsize,
    models: Mutex<Vec<String>>,
    prompts: Mutex<Vec<String>>,
}

impl StubClient {
    pub fn new(respond: impl Fn(&ModelRequest) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
            models: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    /// Always answers with the same text.
    pub fn fixed(body: &'static str) -> Arc<Self> {
        Self::new(move |_| Ok(body.into()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn models(&self) -> Vec<String> {
        self.models.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ModelClient for StubClient {
    async fn invoke(&self, request: &ModelRequest) -> Reply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().unwrap().push(request.model_id.clone());
        self.prompts
            .lock()
            .unwrap()
            .push(request.system_prompt.clone());
        (self.respond)(request)
    }
}

/// Never answers within any reasonable deadline.
pub struct StalledClient;

#[async_trait::async_trait]
impl ModelClient for StalledClient {
    async fn invoke(&self, _request: &ModelRequest) -> Reply {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("{}".into())
    }
}

pub fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}
