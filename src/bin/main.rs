//! ggml-api binary.
//!
//! Serves streaming text generation from a single hot-swappable model.

use clap::Parser;
use ggml_api_core::{
    cli::commands::Commands,
    cli::handlers::{handle_models, handle_server, init_logging},
    config::Settings,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level or filter directive (RUST_LOG takes precedence)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_args = match &cli.command {
        Commands::Server(cmd) => cmd.config.clone(),
        Commands::Models(cmd) => cmd.config_args(),
    };
    let settings = Settings::load(&config_args)?;

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| settings.logging.level.clone());
    let _log_guard = init_logging(&level, settings.logging.directory.as_deref())?;

    match cli.command {
        Commands::Server(_) => {
            tracing::info!("ggml-api {} starting up", env!("CARGO_PKG_VERSION"));
            handle_server(settings).await?
        }
        Commands::Models(_) => handle_models(settings).await?,
    }

    Ok(())
}
