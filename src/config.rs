//! Configuration management for the ggml-api service.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/ggml-api/config.toml`)
//! 3. User-specified configuration file (`--config`)
//! 4. Environment variables (prefixed with `GGML_API_`, sections split by `__`)
//! 5. Command-line arguments
//!
//! # Environment Variables
//!
//! - `GGML_API_MODEL__MODELS_DIR` - Directory holding model files
//! - `GGML_API_MODEL__DEFAULT_MODEL` - Model file loaded at startup
//! - `THREAD_COUNT` - Worker threads for the inference engine when
//!   `model.thread_count` is left at 0

use crate::error::Result;
use crate::runtime::RuntimeConfig;
use clap::Args;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const SYSTEM_CONFIG: &str = "/etc/ggml-api/config.toml";

/// Command-line overrides shared by every subcommand that needs settings.
#[derive(Debug, Default, Clone, Args)]
pub struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen host
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory containing model files
    #[arg(long, value_name = "DIR")]
    pub models_dir: Option<PathBuf>,

    /// Model file loaded at startup
    #[arg(long, value_name = "FILE")]
    pub default_model: Option<String>,

    /// Inference worker threads
    #[arg(long)]
    pub threads: Option<usize>,
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub model: ModelSettings,
    #[serde(default)]
    pub admission: AdmissionSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub request_timeout_secs: u64,
}

/// Model directory and engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    pub models_dir: PathBuf,
    pub default_model: String,
    /// 0 means auto-detect.
    #[serde(default)]
    pub thread_count: usize,
    #[serde(default = "default_context_length")]
    pub context_length: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Admission gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// When set, logs are also written to `ggml-api.log` in this directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .add_source(config::File::with_name(SYSTEM_CONFIG).required(false));

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("GGML_API")
                .prefix_separator("_")
                .separator("__"),
        );

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.apply(args);
        Ok(settings)
    }

    fn apply(&mut self, args: &ConfigArgs) {
        if let Some(host) = &args.host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(dir) = &args.models_dir {
            self.model.models_dir = dir.clone();
        }
        if let Some(model) = &args.default_model {
            self.model.default_model = model.clone();
        }
        if let Some(threads) = args.threads {
            self.model.thread_count = threads;
        }
    }

    /// Listen address in host:port format
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.admission.poll_interval_ms.max(1))
    }

    /// Engine configuration derived from the model settings.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            context_length: self.model.context_length,
            batch_size: self.model.batch_size,
            num_threads: self.model.effective_threads(),
        }
    }
}

impl ModelSettings {
    /// Thread count with auto-detection applied.
    pub fn effective_threads(&self) -> usize {
        if self.thread_count > 0 {
            return self.thread_count;
        }
        env::var("THREAD_COUNT")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or_else(|| (num_cpus::get() / 2).max(1))
    }
}

fn default_context_length() -> usize {
    2048
}

fn default_batch_size() -> usize {
    512
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}
