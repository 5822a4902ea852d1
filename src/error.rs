//! Error types for the ggml-api service.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::result;
use thiserror::Error;

/// A specialized Result type for ggml-api operations.
pub type Result<T> = result::Result<T, Error>;

/// The error type for ggml-api operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller cancelled while waiting for admission. Nothing was mutated.
    #[error("Request cancelled while waiting for the model")]
    AdmissionCancelled,

    /// The requested model file does not exist in the models directory.
    #[error("Model '{0}' not found")]
    ModelNotFound(String),

    /// The model file exists but could not be loaded.
    #[error("Model '{0}' failed to load: {1}")]
    ModelLoadFailed(String, String),

    /// The caller cancelled during ingestion or inference.
    #[error("Generation cancelled")]
    GenerationCancelled,

    /// An operation was attempted on a handle that has already been disposed.
    #[error("Model '{0}' has been disposed")]
    ModelDisposed(String),

    /// Unexpected failure reported by the inference engine.
    #[error("Inference error: {0}")]
    Inference(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Request validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// True for the two cancellation variants.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::AdmissionCancelled | Error::GenerationCancelled)
    }

    /// True when a model swap was refused. The active session is untouched.
    pub fn is_load_failure(&self) -> bool {
        matches!(self, Error::ModelNotFound(_) | Error::ModelLoadFailed(..))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            Error::AdmissionCancelled | Error::GenerationCancelled => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
