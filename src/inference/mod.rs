//! Inference-session orchestration over the single loaded model.

pub mod admission;
pub mod pipeline;
pub mod registry;
pub mod request;
pub mod session;
pub mod stats;

pub use admission::{AdmissionGate, AdmissionPermit};
pub use pipeline::{GenerationPipeline, MODEL_NOT_FOUND, NEW_CONVERSATION};
pub use registry::{list_models, resolve_model_path, ModelRegistry};
pub use request::{CompletionRequest, ControlCommand, InstructRequest};
pub use session::Session;
pub use stats::{Phase, StatisticsRecorder, StatisticsSnapshot};
