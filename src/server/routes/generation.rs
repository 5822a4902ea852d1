//! Streaming generation endpoints

use crate::api::{ContinuationInput, InstructInput};
use crate::error::Error;
use crate::runtime::TokenStream;
use crate::server::state::ServerState;
use axum::{
    body::Body,
    extract::{Json, State},
    http::header,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub fn create_router() -> Router<ServerState> {
    Router::new()
        .route("/instruction", post(instruction))
        .route("/continuation", post(continuation))
}

async fn instruction(State(state): State<ServerState>, Json(input): Json<InstructInput>) -> Response {
    let request = match input.into_request() {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };
    debug!("Instruction: {:?}, input: {:?}", request.prompt.instruction, request.prompt.input);
    stream_tokens(|cancel| state.pipeline.instruct(request, cancel))
}

async fn continuation(State(state): State<ServerState>, Json(input): Json<ContinuationInput>) -> Response {
    let request = match input.into_request() {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };
    debug!("Continuation: input {:?}", request.input);
    stream_tokens(|cancel| state.pipeline.complete(request, cancel))
}

/// Forward generated chunks to a chunked `text/plain` body as they arrive.
fn stream_tokens(start: impl FnOnce(CancellationToken) -> TokenStream) -> Response {
    let cancel = CancellationToken::new();
    let tokens = start(cancel.clone());
    let (tx, rx) = mpsc::channel::<Result<Bytes, Error>>(64);

    tokio::spawn(forward(tokens, tx, cancel));

    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

async fn forward(mut tokens: TokenStream, tx: mpsc::Sender<Result<Bytes, Error>>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = tx.closed() => {
                info!("Client disconnected, cancelling generation");
                cancel.cancel();
                break;
            }
            chunk = tokens.next() => match chunk {
                Some(Ok(text)) => {
                    if tx.send(Ok(Bytes::from(text))).await.is_err() {
                        info!("Client disconnected during streaming");
                        cancel.cancel();
                        break;
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
                None => break,
            }
        }
    }
}
