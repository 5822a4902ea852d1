//! Owner of the single active session and its hot-swap logic.

use super::admission::AdmissionPermit;
use super::session::Session;
use crate::error::{Error, Result};
use crate::runtime::{ModelHandle, ModelLoader, RuntimeConfig};
use parking_lot::RwLock;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Holds exactly one live [`Session`] and replaces it on demand.
pub struct ModelRegistry {
    loader: Arc<dyn ModelLoader>,
    models_dir: PathBuf,
    runtime: RuntimeConfig,
    active: RwLock<Arc<Session>>,
}

impl ModelRegistry {
    /// Load `default_model` from `models_dir` and make it the active session.
    pub async fn new(
        loader: Arc<dyn ModelLoader>,
        models_dir: impl Into<PathBuf>,
        default_model: &str,
        runtime: RuntimeConfig,
    ) -> Result<Self> {
        let models_dir = models_dir.into();
        let path = resolve_model_path(&models_dir, default_model).await?;
        info!("Loading default model {} with {}", default_model, loader.engine_name());
        let start = Instant::now();
        let handle = ModelHandle::load(loader.as_ref(), default_model.trim(), &path, &runtime).await?;
        info!("Loaded default model {} in {:.2?}", default_model, start.elapsed());

        Ok(Self {
            loader,
            models_dir,
            runtime,
            active: RwLock::new(Arc::new(Session::new(handle))),
        })
    }

    /// The currently active session.
    pub fn active(&self) -> Arc<Session> {
        self.active.read().clone()
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Make sure `requested` is the loaded model.
    ///
    /// A blank or absent name, or the name already loaded, returns the
    /// active session with a zero load time. Otherwise the new model is
    /// loaded first; only once it is ready does it replace the active
    /// session (created busy and rebound to `permit`) and the old handle
    /// is disposed. On failure the old session stays active and usable.
    pub async fn ensure_loaded(
        &self,
        requested: Option<&str>,
        permit: &mut AdmissionPermit,
    ) -> Result<(Arc<Session>, Duration)> {
        let current = self.active();
        debug_assert!(
            Arc::ptr_eq(&current, permit.session()),
            "ensure_loaded called without holding the active session"
        );

        let requested = match requested.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) if name != current.model_name() => name,
            _ => return Ok((current, Duration::ZERO)),
        };

        let start = Instant::now();
        let path = resolve_model_path(&self.models_dir, requested).await?;
        let handle = match ModelHandle::load(self.loader.as_ref(), requested, &path, &self.runtime).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Keeping {} active, swap to {} failed: {}", current.model_name(), requested, e);
                return Err(e);
            }
        };

        let session = Arc::new(Session::reserved(handle));
        let retired = std::mem::replace(&mut *self.active.write(), Arc::clone(&session));
        permit.rebind(Arc::clone(&session));
        retired.handle().dispose();

        let elapsed = start.elapsed();
        info!("Swapped model {} -> {} in {:.2?}", retired.model_name(), requested, elapsed);
        Ok((session, elapsed))
    }

    /// File names in the models directory, sorted.
    pub async fn available_models(&self) -> Result<Vec<String>> {
        list_models(&self.models_dir).await
    }

    /// Dispose the active handle at process shutdown.
    pub fn shutdown(&self) {
        self.active.read().handle().dispose();
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("engine", &self.loader.engine_name())
            .field("models_dir", &self.models_dir)
            .field("active", &self.active.read().model_name())
            .finish()
    }
}

/// Resolve `name` to an existing file directly inside `models_dir`.
///
/// Names carrying directory components are rejected so requests cannot
/// reach outside the models directory.
pub async fn resolve_model_path(models_dir: &Path, name: &str) -> Result<PathBuf> {
    let name = name.trim();
    let mut components = Path::new(name).components();
    let plain = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !plain {
        return Err(Error::ModelNotFound(name.to_string()));
    }

    let path = models_dir.join(name);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Ok(path),
        _ => Err(Error::ModelNotFound(name.to_string())),
    }
}

/// Regular files in `models_dir`, by name.
pub async fn list_models(models_dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(models_dir).await?;
    let mut models = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            models.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    models.sort();
    Ok(models)
}
