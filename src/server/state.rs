//! Server state management

use crate::config::Settings;
use crate::error::Result;
use crate::inference::{AdmissionGate, GenerationPipeline, ModelRegistry};
use crate::runtime::ModelLoader;
use std::sync::Arc;
use tracing::info;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    /// Orchestrator owning the registry and admission gate
    pub pipeline: GenerationPipeline,

    /// Loaded configuration
    pub settings: Arc<Settings>,
}

impl ServerState {
    /// Load the default model and build the pipeline around it.
    pub async fn new(settings: Settings, loader: Arc<dyn ModelLoader>) -> Result<Self> {
        info!(
            "Model directory {:?}, default model {}",
            settings.model.models_dir, settings.model.default_model
        );
        let registry = ModelRegistry::new(
            loader,
            settings.model.models_dir.clone(),
            &settings.model.default_model,
            settings.runtime_config(),
        )
        .await?;
        let gate = AdmissionGate::new(settings.poll_interval());
        Ok(Self::with_pipeline(GenerationPipeline::new(Arc::new(registry), gate), settings))
    }

    /// Wrap an already built pipeline.
    pub fn with_pipeline(pipeline: GenerationPipeline, settings: Settings) -> Self {
        Self {
            pipeline,
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        self.pipeline.registry()
    }
}
