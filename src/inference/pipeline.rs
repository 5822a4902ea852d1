//! Orchestrates one generation from admission to statistics.
//!
//! Each call yields a lazy [`TokenStream`]: admission, model swap,
//! ingestion and inference all happen while the caller polls it. The
//! admission permit lives inside the stream, so dropping the stream at
//! any point frees the session.

use super::admission::{AdmissionGate, AdmissionPermit};
use super::registry::ModelRegistry;
use super::request::{CompletionRequest, ControlCommand, InstructRequest};
use super::stats::{Phase, StatisticsRecorder};
use crate::error::{Error, Result};
use crate::runtime::{ends_with_reverse_prompt, InferenceParams, InstructionPrompt, TokenStream};
use async_stream::stream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Sole chunk emitted when a requested model cannot be loaded.
pub const MODEL_NOT_FOUND: &str = "Model not found";

/// Sole chunk emitted after the conversation context is cleared.
pub const NEW_CONVERSATION: &str = "\n\n[New Conversation]\n\n";

enum Prompt {
    Raw(String),
    Instruction(InstructionPrompt),
}

struct Job {
    endpoint: &'static str,
    prompt: Prompt,
    command: Option<ControlCommand>,
    model: Option<String>,
    params: InferenceParams,
    include_ingest: bool,
    include_statistics: bool,
}

/// Drives generations against the registry's active session.
#[derive(Debug, Clone)]
pub struct GenerationPipeline {
    registry: Arc<ModelRegistry>,
    gate: AdmissionGate,
}

impl GenerationPipeline {
    pub fn new(registry: Arc<ModelRegistry>, gate: AdmissionGate) -> Self {
        Self { registry, gate }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Continue `request.input`.
    ///
    /// `forget everything` clears the context, `continue` samples from the
    /// existing context without ingesting anything.
    pub fn complete(&self, request: CompletionRequest, cancel: CancellationToken) -> TokenStream {
        let command = ControlCommand::parse(&request.input);
        self.run(
            Job {
                endpoint: "continuation",
                prompt: Prompt::Raw(request.input),
                command,
                model: request.model,
                params: request.params,
                include_ingest: request.include_ingest,
                include_statistics: request.include_statistics,
            },
            cancel,
        )
    }

    /// Frame an instruction triple and answer it. Control commands are
    /// read from the instruction text.
    pub fn instruct(&self, request: InstructRequest, cancel: CancellationToken) -> TokenStream {
        let command = ControlCommand::parse(&request.prompt.instruction);
        self.run(
            Job {
                endpoint: "instruction",
                prompt: Prompt::Instruction(request.prompt),
                command,
                model: request.model,
                params: request.params,
                include_ingest: request.include_ingest,
                include_statistics: request.include_statistics,
            },
            cancel,
        )
    }

    fn run(&self, job: Job, cancel: CancellationToken) -> TokenStream {
        let registry = Arc::clone(&self.registry);
        let gate = self.gate.clone();
        let request_id = Uuid::new_v4();
        let endpoint = job.endpoint;

        Box::pin(stream! {
            let mut stats = StatisticsRecorder::new();
            stats.reset();

            let (mut permit, waited) = match gate.acquire(&registry, &cancel).await {
                Ok(admitted) => admitted,
                Err(e) => {
                    debug!(%request_id, endpoint, "Not admitted: {}", e);
                    return;
                }
            };
            stats.record(Phase::Wait, waited);
            info!(
                %request_id,
                endpoint,
                model = permit.session().model_name(),
                "Admitted after {:.2?}",
                waited
            );

            let (session, load) = match registry.ensure_loaded(job.model.as_deref(), &mut permit).await {
                Ok(loaded) => loaded,
                Err(e) if e.is_load_failure() => {
                    warn!(%request_id, endpoint, "Model swap refused: {}", e);
                    permit.release();
                    yield Ok(MODEL_NOT_FOUND.to_string());
                    return;
                }
                Err(e) => {
                    error!(%request_id, endpoint, "Model swap failed: {}", e);
                    permit.release();
                    yield Err(e);
                    return;
                }
            };
            stats.record(Phase::Load, load);

            // The engine token stops with the caller, or when this stream is dropped.
            let engine_cancel = cancel.child_token();
            let _stop_engine = engine_cancel.clone().drop_guard();
            let handle = session.handle();

            let ingest_start = Instant::now();
            match job.command {
                Some(ControlCommand::Forget) => {
                    let cleared = session.clear_context().await;
                    permit.release();
                    match cleared {
                        Ok(()) => {
                            info!(%request_id, endpoint, "Cleared conversation context");
                            yield Ok(NEW_CONVERSATION.to_string());
                        }
                        Err(e) => {
                            error!(%request_id, endpoint, "Failed to clear context: {}", e);
                            yield Err(e);
                        }
                    }
                    return;
                }
                Some(ControlCommand::Continue) => {
                    debug!(%request_id, endpoint, "Continuing from existing context");
                }
                None => {
                    let opened = match &job.prompt {
                        Prompt::Raw(text) => handle.ingest_prompt(text, engine_cancel.clone()),
                        Prompt::Instruction(prompt) => {
                            debug!(%request_id, instruction = %prompt.instruction, "Framing instruction");
                            handle.instruction(prompt, engine_cancel.clone())
                        }
                    };
                    let mut tokens = match opened {
                        Ok(tokens) => tokens,
                        Err(e) => {
                            permit.release();
                            error!(%request_id, endpoint, "Ingestion failed to start: {}", e);
                            yield Err(e);
                            return;
                        }
                    };
                    loop {
                        match next_token(&mut tokens, &engine_cancel).await {
                            Ok(Some(token)) => {
                                stats.count_token();
                                if job.include_ingest {
                                    yield Ok(token);
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                if let Some(e) = finish_early(&mut permit, e, request_id, endpoint) {
                                    yield Err(e);
                                }
                                return;
                            }
                        }
                    }
                }
            }
            stats.record(Phase::Ingest, ingest_start.elapsed());

            let infer_start = Instant::now();
            let mut tokens = match handle.inference_stream(&job.params, engine_cancel.clone()) {
                Ok(tokens) => tokens,
                Err(e) => {
                    permit.release();
                    error!(%request_id, endpoint, "Inference failed to start: {}", e);
                    yield Err(e);
                    return;
                }
            };
            let mut produced = 0usize;
            let mut output = String::new();
            while produced < job.params.max_tokens {
                match next_token(&mut tokens, &engine_cancel).await {
                    Ok(Some(token)) => {
                        trace!(%request_id, "token {:?}", token);
                        stats.count_token();
                        produced += 1;
                        output.push_str(&token);
                        yield Ok(token);
                        if ends_with_reverse_prompt(&output, &job.params.reverse_prompts) {
                            debug!(%request_id, "Reverse prompt reached");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        if let Some(e) = finish_early(&mut permit, e, request_id, endpoint) {
                            yield Err(e);
                        }
                        return;
                    }
                }
            }
            drop(tokens);
            stats.record(Phase::Infer, infer_start.elapsed());
            permit.release();

            let snapshot = stats.snapshot();
            info!(
                %request_id,
                endpoint,
                model = session.model_name(),
                tokens = snapshot.tokens,
                "Finished in {:.2?}",
                snapshot.total()
            );
            if job.include_statistics {
                yield Ok(stats.render());
            }
        })
    }
}

/// Next token, or [`Error::GenerationCancelled`] once `cancel` fires.
async fn next_token(tokens: &mut TokenStream, cancel: &CancellationToken) -> Result<Option<String>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::GenerationCancelled),
        token = tokens.next() => token.transpose(),
    }
}

/// Release admission after a mid-stream stop. Cancellation ends the stream
/// quietly; anything else is handed back for the caller to yield.
fn finish_early(permit: &mut AdmissionPermit, e: Error, request_id: Uuid, endpoint: &str) -> Option<Error> {
    permit.release();
    if e.is_cancellation() {
        info!(%request_id, endpoint, "Generation cancelled");
        None
    } else {
        error!(%request_id, endpoint, "Generation failed: {}", e);
        Some(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::EchoLoader;
    use crate::runtime::RuntimeConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn pipeline() -> (TempDir, GenerationPipeline) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("echo.bin"), b"weights").unwrap();
        let registry = ModelRegistry::new(Arc::new(EchoLoader), dir.path(), "echo.bin", RuntimeConfig::default())
            .await
            .unwrap();
        let pipeline = GenerationPipeline::new(Arc::new(registry), AdmissionGate::new(Duration::from_millis(5)));
        (dir, pipeline)
    }

    fn completion(input: &str, max_tokens: usize) -> CompletionRequest {
        CompletionRequest {
            input: input.to_string(),
            params: InferenceParams {
                max_tokens,
                ..Default::default()
            },
            include_statistics: false,
            ..Default::default()
        }
    }

    async fn collect(stream: TokenStream) -> Vec<String> {
        stream.map(|chunk| chunk.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_complete_emits_ingest_then_inference() {
        let (_dir, pipeline) = pipeline().await;
        let chunks = collect(pipeline.complete(completion("hello world", 3), CancellationToken::new())).await;
        assert_eq!(chunks, vec!["hello", "world", "tok0", "tok1", "tok2"]);
        assert!(!pipeline.registry().active().is_busy());
    }

    #[tokio::test]
    async fn test_reverse_prompt_stops_inference() {
        let (_dir, pipeline) = pipeline().await;
        let mut request = completion("hi", 10);
        request.include_ingest = false;
        request.params.reverse_prompts = vec!["tok1".to_string()];
        let chunks = collect(pipeline.complete(request, CancellationToken::new())).await;
        assert_eq!(chunks, vec!["tok0", "tok1"]);
    }

    #[tokio::test]
    async fn test_forget_everything_short_circuits() {
        let (_dir, pipeline) = pipeline().await;
        let chunks = collect(pipeline.complete(completion("Forget Everything", 3), CancellationToken::new())).await;
        assert_eq!(chunks, vec![NEW_CONVERSATION]);
        assert!(!pipeline.registry().active().is_busy());
    }

    #[tokio::test]
    async fn test_unknown_model_reports_not_found() {
        let (_dir, pipeline) = pipeline().await;
        let mut request = completion("hi", 3);
        request.model = Some("nope.bin".to_string());
        let chunks = collect(pipeline.complete(request, CancellationToken::new())).await;
        assert_eq!(chunks, vec![MODEL_NOT_FOUND]);
        assert_eq!(pipeline.registry().active().model_name(), "echo.bin");
        assert!(!pipeline.registry().active().is_busy());
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_session() {
        let (_dir, pipeline) = pipeline().await;
        let mut stream = pipeline.complete(completion("a b c", 100), CancellationToken::new());
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert!(pipeline.registry().active().is_busy());
        drop(stream);
        assert!(!pipeline.registry().active().is_busy());
    }
}
