use crate::{
    config::Settings,
    inference::list_models,
    runtime,
    server::{start_server, state::ServerState},
};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber: console output, plus a log file when
/// `directory` is set. `RUST_LOG` overrides `level`.
///
/// Keep the returned guard alive for the life of the process so buffered
/// file output is flushed.
pub fn init_logging(level: &str, directory: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match directory {
        Some(dir) => {
            let file_appender = RollingFileAppender::new(Rotation::NEVER, dir, "ggml-api.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

pub async fn handle_server(settings: Settings) -> Result<()> {
    let loader = runtime::default_loader().context("Cannot start server")?;
    let addr: SocketAddr = settings
        .listen_addr()
        .parse()
        .context("Invalid listen address")?;

    tracing::info!("Using {} inference engine", loader.engine_name());
    let state = ServerState::new(settings, loader)
        .await
        .context("Failed to load default model")?;

    start_server(addr, state).await.context("Server error")?;
    Ok(())
}

pub async fn handle_models(settings: Settings) -> Result<()> {
    let dir = &settings.model.models_dir;
    let models = list_models(dir)
        .await
        .with_context(|| format!("Failed to read model directory {}", dir.display()))?;
    for model in models {
        println!("{}", model);
    }
    Ok(())
}
