//! LLama.cpp runtime engine implementation
//!
//! `LlamaContext` borrows its `LlamaModel`, so both live on a dedicated
//! worker thread for the lifetime of the handle. Callers talk to the
//! worker through a command channel and receive tokens over a tokio
//! channel. Dropping the model closes the command channel, which ends
//! the worker loop and frees the weights. Nothing here blocks the async
//! runtime: replies come back over tokio channels and the worker is
//! joined on the blocking pool.

use super::{
    ends_with_reverse_prompt, InferenceParams, LanguageModel, ModelLoader, RuntimeConfig,
    SamplingParams, TokenStream,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use llama_cpp_2::{
    context::{params::LlamaContextParams, LlamaContext},
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
    sampling::LlamaSampler,
    token::LlamaToken,
};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::{mpsc as std_mpsc, OnceLock};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tokens buffered between the worker and the consumer.
const TOKEN_CHANNEL_CAPACITY: usize = 64;

static BACKEND: OnceLock<std::result::Result<LlamaBackend, String>> = OnceLock::new();

/// The llama.cpp backend may only be initialised once per process.
fn backend() -> Result<&'static LlamaBackend> {
    BACKEND
        .get_or_init(|| LlamaBackend::init().map_err(|e| format!("{e:?}")))
        .as_ref()
        .map_err(|e| Error::Inference(format!("Failed to initialize llama.cpp backend: {e}")))
}

/// Loads GGUF/GGML files with llama.cpp.
#[derive(Debug, Default)]
pub struct LlamaCppLoader;

#[async_trait]
impl ModelLoader for LlamaCppLoader {
    async fn load(&self, path: &Path, config: &RuntimeConfig) -> Result<Box<dyn LanguageModel>> {
        let path = path.to_path_buf();
        let config = config.clone();
        let model = tokio::task::spawn_blocking(move || LlamaCppModel::spawn(path, config))
            .await
            .map_err(|e| Error::Inference(format!("Model loader task failed: {e}")))??;
        Ok(Box::new(model))
    }

    fn engine_name(&self) -> &'static str {
        "llama.cpp"
    }
}

enum Command {
    Ingest {
        text: String,
        tokens: mpsc::Sender<Result<String>>,
        cancel: CancellationToken,
    },
    Infer {
        params: InferenceParams,
        tokens: mpsc::Sender<Result<String>>,
        cancel: CancellationToken,
    },
    Clear {
        done: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a model owned by its worker thread.
pub struct LlamaCppModel {
    commands: Option<std_mpsc::Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl LlamaCppModel {
    /// Start the worker and block until the model is loaded.
    fn spawn(path: PathBuf, config: RuntimeConfig) -> Result<Self> {
        let (command_tx, command_rx) = std_mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "model".to_string());

        let worker = thread::Builder::new()
            .name(format!("llama-{name}"))
            .spawn(move || worker_main(path, config, command_rx, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands: Some(command_tx),
                worker: Some(worker),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(Error::ModelLoadFailed(name, e.to_string()))
            }
            Err(_) => {
                let _ = worker.join();
                Err(Error::ModelLoadFailed(name, "worker exited during load".to_string()))
            }
        }
    }

    fn submit(&self, command: Command) -> bool {
        self.commands
            .as_ref()
            .map(|tx| tx.send(command).is_ok())
            .unwrap_or(false)
    }

    fn stream_command(&self, build: impl FnOnce(mpsc::Sender<Result<String>>) -> Command) -> TokenStream {
        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        if !self.submit(build(tx.clone())) {
            let _ = tx.try_send(Err(Error::Inference("llama.cpp worker is not running".to_string())));
        }
        Box::pin(ReceiverStream::new(rx))
    }
}

impl LanguageModel for LlamaCppModel {
    fn ingest_prompt(&self, text: &str, cancel: CancellationToken) -> TokenStream {
        let text = text.to_string();
        self.stream_command(|tokens| Command::Ingest { text, tokens, cancel })
    }

    fn inference_stream(&self, params: &InferenceParams, cancel: CancellationToken) -> TokenStream {
        let params = params.clone();
        self.stream_command(|tokens| Command::Infer { params, tokens, cancel })
    }

    fn clear_context(&self) -> BoxFuture<'static, Result<()>> {
        let (done, wait) = oneshot::channel();
        let submitted = self.submit(Command::Clear { done });
        Box::pin(async move {
            if !submitted {
                return Err(Error::Inference("llama.cpp worker is not running".to_string()));
            }
            wait.await
                .map_err(|_| Error::Inference("llama.cpp worker exited".to_string()))?
        })
    }
}

impl Drop for LlamaCppModel {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.commands.take();
        if let Some(worker) = self.worker.take() {
            retire_worker(worker);
        }
    }
}

/// Join `worker` without stalling an async runtime thread. Inside a
/// runtime the join moves to the blocking pool; the worker finishes its
/// current command first.
fn retire_worker(worker: JoinHandle<()>) {
    let join = move || {
        if worker.join().is_err() {
            warn!("llama.cpp worker panicked during shutdown");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}

/// Position bookkeeping for the conversation held in the KV cache.
struct Conversation {
    n_past: i32,
    n_ctx: i32,
    batch_size: usize,
    /// Batch index holding the logits to sample from, if any.
    logits_index: Option<i32>,
    pending: Vec<u8>,
}

impl Conversation {
    fn new(n_ctx: i32, batch_size: usize) -> Self {
        Self {
            n_past: 0,
            n_ctx,
            batch_size: batch_size.max(1),
            logits_index: None,
            pending: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.n_past = 0;
        self.logits_index = None;
        self.pending.clear();
    }

    /// A new prompt is about to overwrite the batch, so any logits from the
    /// previous decode are gone even if ingestion stops early.
    fn begin_ingest(&mut self) {
        self.logits_index = None;
    }

    /// Record a successful decode of `count` tokens. `logits_index` is the
    /// batch slot carrying logits, or `None` when the batch requested none.
    fn decoded(&mut self, count: usize, logits_index: Option<i32>) {
        self.n_past += count as i32;
        self.logits_index = logits_index;
    }

    /// Bytes of a multi-byte character cut off at the end of a command.
    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).to_string();
        self.pending.clear();
        Some(text)
    }

    /// Decode token bytes, holding back incomplete UTF-8 sequences.
    fn piece(&mut self, model: &LlamaModel, token: LlamaToken) -> Option<String> {
        match model.token_to_bytes(token, Special::Tokenize) {
            Ok(bytes) => self.pending.extend_from_slice(&bytes),
            Err(e) => {
                debug!("Failed to convert token {} to bytes: {:?}", token.0, e);
                return None;
            }
        }
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                Some(text)
            }
            // Wait for the rest of a multi-byte character, but never forever.
            Err(e) if e.error_len().is_none() && self.pending.len() < 8 => None,
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).to_string();
                self.pending.clear();
                Some(text)
            }
        }
    }
}

fn worker_main(
    path: PathBuf,
    config: RuntimeConfig,
    commands: std_mpsc::Receiver<Command>,
    ready: std_mpsc::SyncSender<Result<()>>,
) {
    let backend = match backend() {
        Ok(backend) => backend,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let model = match LlamaModel::load_from_file(backend, &path, &LlamaModelParams::default()) {
        Ok(model) => model,
        Err(e) => {
            let _ = ready.send(Err(Error::Inference(format!("{e:?}"))));
            return;
        }
    };

    let threads = config.num_threads.max(1) as i32;
    let context_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(config.context_length as u32))
        .with_n_batch(config.batch_size as u32)
        .with_n_threads(threads)
        .with_n_threads_batch(threads);

    let mut context = match model.new_context(backend, context_params) {
        Ok(context) => context,
        Err(e) => {
            let _ = ready.send(Err(Error::Inference(format!("Failed to create context: {e:?}"))));
            return;
        }
    };

    info!(
        "Loaded {} ({} parameters, context {}, {} threads)",
        path.display(),
        model.n_params(),
        config.context_length,
        threads
    );
    let _ = ready.send(Ok(()));

    let mut batch = LlamaBatch::new(config.batch_size.max(1), 1);
    let mut conversation = Conversation::new(context.n_ctx() as i32, config.batch_size);

    for command in commands {
        match command {
            Command::Ingest { text, tokens, cancel } => {
                let result = ingest(&model, &mut context, &mut batch, &mut conversation, &text, &tokens, &cancel);
                finish(&mut conversation, &tokens, &cancel, result);
            }
            Command::Infer { params, tokens, cancel } => {
                let result = infer(&model, &mut context, &mut batch, &mut conversation, &params, &tokens, &cancel);
                finish(&mut conversation, &tokens, &cancel, result);
            }
            Command::Clear { done } => {
                context.clear_kv_cache();
                batch.clear();
                conversation.reset();
                let _ = done.send(Ok(()));
            }
        }
    }

    debug!("llama.cpp worker for {} exiting", path.display());
}

/// End of an ingest or infer command. Held-back bytes never carry over
/// into the next request.
fn finish(
    conversation: &mut Conversation,
    tokens: &mpsc::Sender<Result<String>>,
    cancel: &CancellationToken,
    result: Result<()>,
) {
    let rest = conversation.flush();
    match result {
        Ok(()) => {
            if let Some(rest) = rest.filter(|_| !cancel.is_cancelled()) {
                let _ = tokens.blocking_send(Ok(rest));
            }
        }
        Err(e) => {
            let _ = tokens.blocking_send(Err(e));
        }
    }
}

fn ingest(
    model: &LlamaModel,
    context: &mut LlamaContext<'_>,
    batch: &mut LlamaBatch,
    conversation: &mut Conversation,
    text: &str,
    tokens: &mpsc::Sender<Result<String>>,
    cancel: &CancellationToken,
) -> Result<()> {
    conversation.begin_ingest();
    let add_bos = if conversation.n_past == 0 { AddBos::Always } else { AddBos::Never };
    let prompt = model
        .str_to_token(text, add_bos)
        .map_err(|e| Error::Inference(format!("Failed to tokenize prompt: {e:?}")))?;

    if conversation.n_past + prompt.len() as i32 >= conversation.n_ctx {
        return Err(Error::Inference(format!(
            "context window of {} tokens exhausted; send \"forget everything\" to start over",
            conversation.n_ctx
        )));
    }

    let chunk_size = conversation.batch_size;
    let total = prompt.len();
    for (chunk_index, chunk) in prompt.chunks(chunk_size).enumerate() {
        batch.clear();
        for (offset, token) in chunk.iter().enumerate() {
            let is_last = chunk_index * chunk_size + offset + 1 == total;
            batch
                .add(*token, conversation.n_past + offset as i32, &[0], is_last)
                .map_err(|e| Error::Inference(format!("Failed to add token to batch: {e:?}")))?;
        }
        context
            .decode(batch)
            .map_err(|e| Error::Inference(format!("Failed to decode prompt: {e:?}")))?;
        let final_chunk = chunk_index * chunk_size + chunk.len() == total;
        conversation.decoded(chunk.len(), final_chunk.then(|| batch.n_tokens() - 1));

        for token in chunk {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if let Some(piece) = conversation.piece(model, *token) {
                if tokens.blocking_send(Ok(piece)).is_err() {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

fn infer(
    model: &LlamaModel,
    context: &mut LlamaContext<'_>,
    batch: &mut LlamaBatch,
    conversation: &mut Conversation,
    params: &InferenceParams,
    tokens: &mpsc::Sender<Result<String>>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut sampler = build_sampler(model, &params.sampling);
    let mut output = String::new();

    for _ in 0..params.max_tokens {
        if cancel.is_cancelled() {
            break;
        }
        let logits_index = conversation
            .logits_index
            .ok_or_else(|| Error::Inference("context is empty; nothing to continue from".to_string()))?;
        if conversation.n_past >= conversation.n_ctx {
            return Err(Error::Inference(format!(
                "context window of {} tokens exhausted; send \"forget everything\" to start over",
                conversation.n_ctx
            )));
        }

        let token = sampler.sample(context, logits_index);
        if model.is_eog_token(token) && !params.ignore_eos {
            debug!("End of sequence after {} bytes", output.len());
            break;
        }

        batch.clear();
        conversation.logits_index = None;
        batch
            .add(token, conversation.n_past, &[0], true)
            .map_err(|e| Error::Inference(format!("Failed to add generated token to batch: {e:?}")))?;
        context
            .decode(batch)
            .map_err(|e| Error::Inference(format!("Failed to decode generated token: {e:?}")))?;
        conversation.decoded(1, Some(batch.n_tokens() - 1));

        if let Some(piece) = conversation.piece(model, token) {
            output.push_str(&piece);
            if tokens.blocking_send(Ok(piece)).is_err() {
                break;
            }
        }
        if ends_with_reverse_prompt(&output, &params.reverse_prompts) {
            debug!("Reverse prompt hit");
            break;
        }
    }
    Ok(())
}

fn build_sampler(model: &LlamaModel, sampling: &SamplingParams) -> LlamaSampler {
    if sampling.tfs_z != 1.0 || sampling.penalize_newlines || sampling.penalize_spaces {
        debug!("tail-free sampling and newline/space penalties are not supported by llama.cpp; ignoring");
    }
    let seed = rand_seed();
    let penalties = LlamaSampler::penalties(64, sampling.repetition_penalty, 0.0, 0.0);

    match sampling.mirostat {
        1 => LlamaSampler::chain_simple([
            penalties,
            LlamaSampler::temp(sampling.temperature),
            LlamaSampler::mirostat(model.n_vocab(), seed, sampling.mirostat_tau, sampling.mirostat_eta, 100),
        ]),
        2 => LlamaSampler::chain_simple([
            penalties,
            LlamaSampler::temp(sampling.temperature),
            LlamaSampler::mirostat_v2(seed, sampling.mirostat_tau, sampling.mirostat_eta),
        ]),
        _ => LlamaSampler::chain_simple([
            penalties,
            LlamaSampler::top_k(sampling.top_k),
            LlamaSampler::typical(sampling.typical_p, 1),
            LlamaSampler::top_p(sampling.top_p, 1),
            LlamaSampler::temp(sampling.temperature),
            LlamaSampler::dist(seed),
        ]),
    }
}

fn rand_seed() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
}
