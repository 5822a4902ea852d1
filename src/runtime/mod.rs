//! Runtime abstraction over the inference engine.
//!
//! The engine itself (tokenizer, weights, forward pass, sampling) lives
//! behind [`ModelLoader`] and [`LanguageModel`]. Everything above this
//! module only sees token streams.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(feature = "llamacpp")]
pub mod llamacpp_engine;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "llamacpp")]
pub use llamacpp_engine::LlamaCppLoader;

/// Lazily produced text tokens. Ends early when the engine stops or the
/// cancellation token fires.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Loads model files into a [`LanguageModel`].
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Load the model at `path`.
    async fn load(&self, path: &Path, config: &RuntimeConfig) -> Result<Box<dyn LanguageModel>>;

    /// Short engine name for logs.
    fn engine_name(&self) -> &'static str;
}

/// A loaded model and its conversation context.
///
/// The context persists across calls until [`LanguageModel::clear_context`].
pub trait LanguageModel: Send + Sync {
    /// Feed `text` into the context, yielding each ingested token.
    fn ingest_prompt(&self, text: &str, cancel: CancellationToken) -> TokenStream;

    /// Frame an instruction and feed it into the context.
    fn instruction(&self, prompt: &InstructionPrompt, cancel: CancellationToken) -> TokenStream {
        self.ingest_prompt(&prompt.render(), cancel)
    }

    /// Sample new tokens from the current context.
    fn inference_stream(&self, params: &InferenceParams, cancel: CancellationToken) -> TokenStream;

    /// Forget the conversation so far. Resolves once the engine has
    /// dropped the context.
    fn clear_context(&self) -> BoxFuture<'static, Result<()>>;

    /// Release engine resources.
    fn dispose(self: Box<Self>) {}
}

/// Engine configuration applied at load time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub context_length: usize,
    pub batch_size: usize,
    pub num_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            context_length: 2048,
            batch_size: 512,
            num_threads: (num_cpus::get() / 2).max(1),
        }
    }
}

/// Sampling controls passed through to the engine untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub top_k: i32,
    pub top_p: f32,
    pub temperature: f32,
    pub repetition_penalty: f32,
    /// 0 = off, 1 = mirostat, 2 = mirostat 2.0
    pub mirostat: i32,
    /// Mirostat target entropy (tau)
    pub mirostat_tau: f32,
    /// Mirostat learning rate (eta)
    pub mirostat_eta: f32,
    pub tfs_z: f32,
    pub typical_p: f32,
    pub penalize_newlines: bool,
    pub penalize_spaces: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.8,
            temperature: 0.1,
            repetition_penalty: 1.2,
            mirostat: 2,
            mirostat_tau: 3.0,
            mirostat_eta: 0.01,
            tfs_z: 1.0,
            typical_p: 1.0,
            penalize_newlines: false,
            penalize_spaces: false,
        }
    }
}

/// Parameters for one inference phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceParams {
    pub max_tokens: usize,
    /// Stop sequences; inference ends once the output ends with any of them.
    pub reverse_prompts: Vec<String>,
    pub ignore_eos: bool,
    pub sampling: SamplingParams,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            reverse_prompts: Vec::new(),
            ignore_eos: false,
            sampling: SamplingParams::default(),
        }
    }
}

/// Instruction / context / desired-output-prefix triple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionPrompt {
    pub instruction: String,
    pub input: String,
    pub output_prefix: String,
}

impl InstructionPrompt {
    /// Alpaca-style framing.
    pub fn render(&self) -> String {
        let mut prompt = String::from(
            "Below is an instruction that describes a task. Write a response that appropriately completes the request.\n\n",
        );
        prompt.push_str("### Instruction:\n");
        prompt.push_str(&self.instruction);
        prompt.push_str("\n\n");
        if !self.input.trim().is_empty() {
            prompt.push_str("### Input:\n");
            prompt.push_str(&self.input);
            prompt.push_str("\n\n");
        }
        prompt.push_str("### Response:\n");
        prompt.push_str(&self.output_prefix);
        prompt
    }
}

/// True when `output` ends with one of the non-empty `reverse_prompts`.
pub fn ends_with_reverse_prompt(output: &str, reverse_prompts: &[String]) -> bool {
    reverse_prompts
        .iter()
        .any(|stop| !stop.is_empty() && output.ends_with(stop.as_str()))
}

/// One loaded model, identified by its file name.
///
/// Owns the engine instance. After [`ModelHandle::dispose`] every
/// operation fails with [`Error::ModelDisposed`].
pub struct ModelHandle {
    name: String,
    path: PathBuf,
    model: RwLock<Option<Box<dyn LanguageModel>>>,
}

impl ModelHandle {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, model: Box<dyn LanguageModel>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            model: RwLock::new(Some(model)),
        }
    }

    /// Load `path` through `loader` and wrap the result.
    pub async fn load(
        loader: &dyn ModelLoader,
        name: &str,
        path: &Path,
        config: &RuntimeConfig,
    ) -> Result<Self> {
        debug!("Loading model {} from {:?} with {}", name, path, loader.engine_name());
        let model = loader.load(path, config).await.map_err(|e| match e {
            Error::ModelNotFound(_) | Error::ModelLoadFailed(..) => e,
            other => Error::ModelLoadFailed(name.to_string(), other.to_string()),
        })?;
        Ok(Self::new(name, path, model))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_disposed(&self) -> bool {
        self.model.read().is_none()
    }

    fn with_model<T>(&self, f: impl FnOnce(&dyn LanguageModel) -> T) -> Result<T> {
        let guard = self.model.read();
        match guard.as_deref() {
            Some(model) => Ok(f(model)),
            None => Err(Error::ModelDisposed(self.name.clone())),
        }
    }

    pub fn ingest_prompt(&self, text: &str, cancel: CancellationToken) -> Result<TokenStream> {
        self.with_model(|model| model.ingest_prompt(text, cancel))
    }

    pub fn instruction(&self, prompt: &InstructionPrompt, cancel: CancellationToken) -> Result<TokenStream> {
        self.with_model(|model| model.instruction(prompt, cancel))
    }

    pub fn inference_stream(&self, params: &InferenceParams, cancel: CancellationToken) -> Result<TokenStream> {
        self.with_model(|model| model.inference_stream(params, cancel))
    }

    pub async fn clear_context(&self) -> Result<()> {
        let cleared = self.with_model(|model| model.clear_context())?;
        cleared.await
    }

    /// Release the engine. Idempotent.
    pub fn dispose(&self) {
        let model = self.model.write().take();
        if let Some(model) = model {
            model.dispose();
            info!("Disposed model {}", self.name);
        }
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Loader selected at compile time.
pub fn default_loader() -> Result<Arc<dyn ModelLoader>> {
    #[cfg(feature = "llamacpp")]
    {
        Ok(Arc::new(LlamaCppLoader::default()))
    }
    #[cfg(not(feature = "llamacpp"))]
    {
        Err(Error::Config(
            "no inference engine compiled in; rebuild with `--features llamacpp`".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::EchoModel;
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_instruction_framing() {
        let prompt = InstructionPrompt {
            instruction: "Summarize".into(),
            input: "A long text".into(),
            output_prefix: "Summary:".into(),
        };
        let rendered = prompt.render();
        assert!(rendered.contains("### Instruction:\nSummarize\n\n"));
        assert!(rendered.contains("### Input:\nA long text\n\n"));
        assert!(rendered.ends_with("### Response:\nSummary:"));

        let bare = InstructionPrompt {
            instruction: "Tell me a joke".into(),
            ..Default::default()
        };
        assert!(!bare.render().contains("### Input:"));
    }

    #[test]
    fn test_reverse_prompt_detection() {
        let stops = vec!["User:".to_string(), String::new()];
        assert!(ends_with_reverse_prompt("Hello there.\nUser:", &stops));
        assert!(!ends_with_reverse_prompt("User: hello", &stops));
        assert!(!ends_with_reverse_prompt("anything", &[]));
    }

    #[tokio::test]
    async fn test_handle_rejects_use_after_dispose() {
        let handle = ModelHandle::new("echo.bin", "/models/echo.bin", Box::new(EchoModel::default()));
        let tokens: Vec<_> = handle
            .ingest_prompt("a b", CancellationToken::new())
            .unwrap()
            .collect()
            .await;
        assert_eq!(tokens.len(), 2);

        handle.dispose();
        assert!(handle.is_disposed());
        assert!(matches!(
            handle.ingest_prompt("a", CancellationToken::new()),
            Err(Error::ModelDisposed(_))
        ));
        assert!(matches!(handle.clear_context().await, Err(Error::ModelDisposed(_))));
        // Second dispose is a no-op.
        handle.dispose();
    }
}
