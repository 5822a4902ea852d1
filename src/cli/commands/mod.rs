pub mod models;
pub mod server;

pub use models::ModelsCommand;
pub use server::ServerCommand;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Start the generation server
    Server(ServerCommand),
    /// List model files available for loading
    Models(ModelsCommand),
}
