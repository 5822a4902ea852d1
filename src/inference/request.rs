//! Immutable per-call request values.

use crate::runtime::{InferenceParams, InstructionPrompt};

/// Prompt continuation: ingest `input`, then sample.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub input: String,
    /// Model file to switch to; blank keeps the active model.
    pub model: Option<String>,
    pub params: InferenceParams,
    pub include_ingest: bool,
    pub include_statistics: bool,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            input: String::new(),
            model: None,
            params: InferenceParams::default(),
            include_ingest: true,
            include_statistics: true,
        }
    }
}

/// Instruction-framed generation.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructRequest {
    pub prompt: InstructionPrompt,
    pub model: Option<String>,
    pub params: InferenceParams,
    pub include_ingest: bool,
    pub include_statistics: bool,
}

impl Default for InstructRequest {
    fn default() -> Self {
        Self {
            prompt: InstructionPrompt::default(),
            model: None,
            params: InferenceParams::default(),
            include_ingest: false,
            include_statistics: false,
        }
    }
}

/// Inputs interpreted as commands instead of prompt text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Clear the conversation context and stop.
    Forget,
    /// Skip ingestion and sample from the existing context.
    Continue,
}

impl ControlCommand {
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("forget everything") {
            Some(Self::Forget)
        } else if input.eq_ignore_ascii_case("continue") {
            Some(Self::Continue)
        } else {
            None
        }
    }
}
