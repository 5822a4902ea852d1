use crate::error::{Error, Result};
use crate::inference::{CompletionRequest, InstructRequest};
use crate::runtime::{InferenceParams, InstructionPrompt, SamplingParams};
use serde::{Deserialize, Serialize};

/// Body of `POST /continuation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationInput {
    #[serde(rename = "maxTokens")]
    pub max_tokens: i64,
    pub input: String,
    #[serde(rename = "reversePrompts", default)]
    pub reverse_prompts: Vec<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub ignore_eos: bool,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_continuation_temperature")]
    pub temperature: f32,
    #[serde(default = "default_mirostat")]
    pub mirostat: i32,
    #[serde(default = "default_entropy")]
    pub entropy: f32,
    #[serde(rename = "learningRate", default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(rename = "tailFreeSamplingRate", default = "default_one")]
    pub tail_free_sampling_rate: f32,
    #[serde(default = "default_one")]
    pub typical_p: f32,
    #[serde(rename = "penalizeNewLines", default)]
    pub penalize_new_lines: bool,
    #[serde(rename = "penalizeSpaces", default)]
    pub penalize_spaces: bool,
    #[serde(default = "default_continuation_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(rename = "includeIngest", default = "default_true")]
    pub include_ingest: bool,
    #[serde(rename = "includeStatistics", default = "default_true")]
    pub include_statistics: bool,
}

/// Body of `POST /instruction`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructInput {
    #[serde(rename = "maxTokens")]
    pub max_tokens: i64,
    #[serde(rename = "reversePrompts", default)]
    pub reverse_prompts: Vec<String>,
    #[serde(default = "default_instruction")]
    pub instruction: String,
    #[serde(default)]
    pub input: String,
    /// Prefix the response should start with.
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub ignore_eos: bool,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_instruct_temperature")]
    pub temperature: f32,
    #[serde(default = "default_instruct_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(default = "default_mirostat")]
    pub mirostat: i32,
    #[serde(default = "default_entropy")]
    pub entropy: f32,
    #[serde(rename = "learningRate", default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(rename = "tailFreeSamplingRate", default = "default_one")]
    pub tail_free_sampling_rate: f32,
    #[serde(default = "default_one")]
    pub typical_p: f32,
    #[serde(rename = "penalizeNewLines", default)]
    pub penalize_new_lines: bool,
    #[serde(rename = "penalizeSpaces", default)]
    pub penalize_spaces: bool,
    #[serde(rename = "includeIngest", default)]
    pub include_ingest: bool,
    #[serde(rename = "includeStatistics", default)]
    pub include_statistics: bool,
}

impl ContinuationInput {
    pub fn validate(&self) -> Result<()> {
        validate_common(self.max_tokens, self.top_p, self.typical_p, self.temperature)
    }

    /// Validate and convert into a pipeline request.
    pub fn into_request(self) -> Result<CompletionRequest> {
        self.validate()?;
        let sampling = SamplingParams {
            top_k: self.top_k,
            top_p: self.top_p,
            temperature: self.temperature,
            repetition_penalty: self.repetition_penalty,
            mirostat: self.mirostat,
            mirostat_tau: self.entropy,
            mirostat_eta: self.learning_rate,
            tfs_z: self.tail_free_sampling_rate,
            typical_p: self.typical_p,
            penalize_newlines: self.penalize_new_lines,
            penalize_spaces: self.penalize_spaces,
        };
        Ok(CompletionRequest {
            input: self.input,
            model: model_override(self.model),
            params: InferenceParams {
                max_tokens: self.max_tokens as usize,
                reverse_prompts: self.reverse_prompts,
                ignore_eos: self.ignore_eos,
                sampling,
            },
            include_ingest: self.include_ingest,
            include_statistics: self.include_statistics,
        })
    }
}

impl InstructInput {
    pub fn validate(&self) -> Result<()> {
        validate_common(self.max_tokens, self.top_p, self.typical_p, self.temperature)
    }

    /// Validate and convert into a pipeline request.
    pub fn into_request(self) -> Result<InstructRequest> {
        self.validate()?;
        let sampling = SamplingParams {
            top_k: self.top_k,
            top_p: self.top_p,
            temperature: self.temperature,
            repetition_penalty: self.repetition_penalty,
            mirostat: self.mirostat,
            mirostat_tau: self.entropy,
            mirostat_eta: self.learning_rate,
            tfs_z: self.tail_free_sampling_rate,
            typical_p: self.typical_p,
            penalize_newlines: self.penalize_new_lines,
            penalize_spaces: self.penalize_spaces,
        };
        Ok(InstructRequest {
            prompt: InstructionPrompt {
                instruction: self.instruction,
                input: self.input,
                output_prefix: self.output,
            },
            model: model_override(self.model),
            params: InferenceParams {
                max_tokens: self.max_tokens as usize,
                reverse_prompts: self.reverse_prompts,
                ignore_eos: self.ignore_eos,
                sampling,
            },
            include_ingest: self.include_ingest,
            include_statistics: self.include_statistics,
        })
    }
}

fn validate_common(max_tokens: i64, top_p: f32, typical_p: f32, temperature: f32) -> Result<()> {
    if max_tokens < 1 {
        return Err(Error::Validation(format!("maxTokens must be at least 1, got {max_tokens}")));
    }
    if !(0.0..=1.0).contains(&top_p) {
        return Err(Error::Validation(format!("top_p must be within [0, 1], got {top_p}")));
    }
    if !(0.0..=1.0).contains(&typical_p) {
        return Err(Error::Validation(format!("typical_p must be within [0, 1], got {typical_p}")));
    }
    if temperature.is_nan() || temperature < 0.0 {
        return Err(Error::Validation(format!("temperature must not be negative, got {temperature}")));
    }
    Ok(())
}

fn model_override(model: String) -> Option<String> {
    let trimmed = model.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> f32 {
    1.0
}

fn default_top_k() -> i32 {
    40
}

fn default_top_p() -> f32 {
    0.8
}

fn default_mirostat() -> i32 {
    2
}

fn default_entropy() -> f32 {
    3.0
}

fn default_learning_rate() -> f32 {
    0.01
}

fn default_continuation_temperature() -> f32 {
    0.1
}

fn default_continuation_repetition_penalty() -> f32 {
    1.2
}

fn default_instruct_temperature() -> f32 {
    0.85
}

fn default_instruct_repetition_penalty() -> f32 {
    0.2
}

fn default_instruction() -> String {
    "Tell me a joke".to_string()
}
