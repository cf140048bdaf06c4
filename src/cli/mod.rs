//! CLI commands for `ocap-kernel`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ocap-kernel")]
#[command(about = "Object-capability kernel: vat host, c-list translation, run queue, remote transport")]
#[command(version)]
pub struct Cli {
    /// Path to an `ocap-kernel.toml` config file. Defaults to the platform
    /// config directory, then built-in defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the kernel and block until interrupted.
    Run,
    /// Launch a subcluster from a declarative config file and print the
    /// settled bootstrap result.
    Launch {
        /// Path to a JSON subcluster config (`{bootstrap, vats, bundles?, services?}`).
        file: PathBuf,
    },
    /// Print a point-in-time kernel status snapshot as JSON.
    Status,
}
