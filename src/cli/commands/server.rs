use crate::config::ConfigArgs;
use clap::Args;

#[derive(Args)]
pub struct ServerCommand {
    #[command(flatten)]
    pub config: ConfigArgs,
}
