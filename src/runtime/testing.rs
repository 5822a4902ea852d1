//! Minimal in-memory engine for unit tests.

use super::{InferenceParams, LanguageModel, ModelLoader, RuntimeConfig, TokenStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Echoes prompt words back as ingestion tokens and produces `tok{n}`
/// tokens during inference.
#[derive(Default)]
pub(crate) struct EchoModel {
    pub context: Arc<Mutex<Vec<String>>>,
}

impl LanguageModel for EchoModel {
    fn ingest_prompt(&self, text: &str, _cancel: CancellationToken) -> TokenStream {
        let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        self.context.lock().extend(words.iter().cloned());
        Box::pin(futures::stream::iter(words.into_iter().map(Ok)))
    }

    fn inference_stream(&self, params: &InferenceParams, cancel: CancellationToken) -> TokenStream {
        let max = params.max_tokens;
        Box::pin(async_stream::stream! {
            for n in 0..max {
                if cancel.is_cancelled() {
                    break;
                }
                yield Ok(format!("tok{n}"));
                tokio::task::yield_now().await;
            }
        })
    }

    fn clear_context(&self) -> BoxFuture<'static, Result<()>> {
        self.context.lock().clear();
        Box::pin(future::ready(Ok(())))
    }
}

/// Loads an [`EchoModel`] for any existing file.
#[derive(Default)]
pub(crate) struct EchoLoader;

#[async_trait]
impl ModelLoader for EchoLoader {
    async fn load(&self, path: &Path, _config: &RuntimeConfig) -> Result<Box<dyn LanguageModel>> {
        if !path.is_file() {
            return Err(Error::ModelNotFound(path.display().to_string()));
        }
        Ok(Box::new(EchoModel::default()))
    }

    fn engine_name(&self) -> &'static str {
        "echo"
    }
}
