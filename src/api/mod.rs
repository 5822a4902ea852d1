//! JSON request bodies accepted by the HTTP surface.
//!
//! Field names follow the wire format clients already send
//! (`maxTokens`, `top_k`, `learningRate`, ...), so the Rust names are
//! mapped with serde renames.

pub mod inputs;

pub use inputs::{ContinuationInput, InstructInput};
