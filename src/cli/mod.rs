//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Running the HTTP service
//! - Listing model files

pub mod commands;
pub mod handlers;

pub use handlers::{handle_models, handle_server, init_logging};
