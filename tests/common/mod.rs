//! Scripted in-memory engine and helpers shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use ggml_api_core::error::{Error, Result};
use ggml_api_core::inference::{AdmissionGate, CompletionRequest, GenerationPipeline, ModelRegistry};
use ggml_api_core::runtime::{InferenceParams, LanguageModel, ModelLoader, RuntimeConfig, TokenStream};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// How the scripted engine behaves.
#[derive(Debug, Clone)]
pub struct Script {
    /// Sleep before every produced token.
    pub token_delay: Duration,
    /// Sleep inside every load.
    pub load_delay: Duration,
    /// Time the engine takes to drop its context.
    pub clear_delay: Duration,
    /// Inference ends after this many tokens unless `ignore_eos` is set.
    pub eos_after: Option<usize>,
    /// Inference yields an engine error in place of token `n`.
    pub fail_after: Option<usize>,
    /// Files that exist but fail to load.
    pub broken_models: Vec<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            token_delay: Duration::from_millis(1),
            load_delay: Duration::ZERO,
            clear_delay: Duration::ZERO,
            eos_after: None,
            fail_after: None,
            broken_models: Vec::new(),
        }
    }
}

/// Instrumentation shared by every model the loader creates.
#[derive(Default)]
pub struct Recorder {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    pub ingest_calls: AtomicUsize,
    pub infer_calls: AtomicUsize,
    pub clear_calls: AtomicUsize,
    events: Mutex<Vec<String>>,
}

impl Recorder {
    /// Load/dispose/clear events in the order they happened.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Largest number of token streams that were ever live at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn log(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn enter(self: &Arc<Self>) -> InFlight {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(Arc::clone(self))
    }
}

struct InFlight(Arc<Recorder>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ScriptedModel {
    name: String,
    script: Script,
    recorder: Arc<Recorder>,
}

impl LanguageModel for ScriptedModel {
    fn ingest_prompt(&self, text: &str, cancel: CancellationToken) -> TokenStream {
        self.recorder.ingest_calls.fetch_add(1, Ordering::SeqCst);
        let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        let recorder = Arc::clone(&self.recorder);
        let delay = self.script.token_delay;
        Box::pin(async_stream::stream! {
            let _in_flight = recorder.enter();
            for word in words {
                if cancel.is_cancelled() {
                    break;
                }
                tokio::time::sleep(delay).await;
                yield Ok(word);
            }
        })
    }

    fn inference_stream(&self, params: &InferenceParams, cancel: CancellationToken) -> TokenStream {
        self.recorder.infer_calls.fetch_add(1, Ordering::SeqCst);
        let recorder = Arc::clone(&self.recorder);
        let script = self.script.clone();
        let max_tokens = params.max_tokens;
        let ignore_eos = params.ignore_eos;
        Box::pin(async_stream::stream! {
            let _in_flight = recorder.enter();
            for n in 0..max_tokens {
                if cancel.is_cancelled() {
                    break;
                }
                if script.fail_after == Some(n) {
                    yield Err(Error::Inference("injected fault".to_string()));
                    break;
                }
                if !ignore_eos && script.eos_after == Some(n) {
                    break;
                }
                tokio::time::sleep(script.token_delay).await;
                yield Ok(format!("t{n}"));
            }
        })
    }

    fn clear_context(&self) -> BoxFuture<'static, Result<()>> {
        self.recorder.clear_calls.fetch_add(1, Ordering::SeqCst);
        self.recorder.log(format!("clear:{}", self.name));
        let delay = self.script.clear_delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(())
        })
    }

    fn dispose(self: Box<Self>) {
        self.recorder.log(format!("dispose:{}", self.name));
    }
}

pub struct ScriptedLoader {
    script: Script,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl ModelLoader for ScriptedLoader {
    async fn load(&self, path: &Path, _config: &RuntimeConfig) -> Result<Box<dyn LanguageModel>> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.recorder.log(format!("load-start:{name}"));
        tokio::time::sleep(self.script.load_delay).await;

        if !path.is_file() {
            return Err(Error::ModelNotFound(name));
        }
        if self.script.broken_models.contains(&name) {
            return Err(Error::ModelLoadFailed(name, "bad magic".to_string()));
        }

        self.recorder.log(format!("load-done:{name}"));
        Ok(Box::new(ScriptedModel {
            name,
            script: self.script.clone(),
            recorder: Arc::clone(&self.recorder),
        }))
    }

    fn engine_name(&self) -> &'static str {
        "scripted"
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub recorder: Arc<Recorder>,
    pub pipeline: GenerationPipeline,
}

impl Harness {
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        self.pipeline.registry()
    }

    /// Poll until the active session is free or `timeout` passes.
    pub async fn wait_until_free(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !self.registry().active().is_busy() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        !self.registry().active().is_busy()
    }
}

/// Pipeline over a temp models directory holding `models`; the first one
/// is loaded at startup.
pub async fn harness(script: Script, models: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    for model in models {
        std::fs::write(dir.path().join(model), b"weights").unwrap();
    }
    let recorder = Arc::new(Recorder::default());
    let loader = Arc::new(ScriptedLoader {
        script,
        recorder: Arc::clone(&recorder),
    });
    let registry = ModelRegistry::new(loader, dir.path(), models[0], RuntimeConfig::default())
        .await
        .unwrap();
    let pipeline = GenerationPipeline::new(Arc::new(registry), AdmissionGate::new(Duration::from_millis(5)));
    Harness { dir, recorder, pipeline }
}

/// Completion that only emits inference tokens.
pub fn completion(input: &str, max_tokens: usize) -> CompletionRequest {
    CompletionRequest {
        input: input.to_string(),
        params: InferenceParams {
            max_tokens,
            ..Default::default()
        },
        include_ingest: false,
        include_statistics: false,
        ..Default::default()
    }
}

/// Collect chunks until the stream ends or yields an error.
pub async fn drain(mut stream: TokenStream) -> (Vec<String>, Option<Error>) {
    let mut chunks = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => chunks.push(chunk),
            Err(e) => return (chunks, Some(e)),
        }
    }
    (chunks, None)
}
