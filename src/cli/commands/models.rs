use crate::config::ConfigArgs;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct ModelsCommand {
    /// Directory containing model files
    #[arg(long, value_name = "DIR")]
    pub models_dir: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl ModelsCommand {
    pub fn config_args(&self) -> ConfigArgs {
        ConfigArgs {
            config: self.config.clone(),
            models_dir: self.models_dir.clone(),
            ..Default::default()
        }
    }
}
