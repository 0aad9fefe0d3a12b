pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rmm")]
#[command(about = "Remote management: server, agent and operator tooling")]
pub struct Args {
    /// Path to the rmm data directory (defaults to ~/.rmm)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
