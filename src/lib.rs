pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod inference;
pub mod runtime;
pub mod server;

// Re-export commonly used types
pub use crate::config::Settings;
pub use crate::error::{Error, Result};
pub use crate::inference::{GenerationPipeline, ModelRegistry};
