//! Command-line surface for the demonstration binary.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "synapse", about = "Submit one query to a local model fleet")]
pub struct Cli {
    /// Path to a model registry TOML document (spec §6). If absent, a
    /// single stub model is registered so the binary runs standalone.
    #[arg(long)]
    pub registry: Option<PathBuf>,

    /// Path to a control-plane configuration TOML document.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// The query text.
    pub query: String,

    /// auto | standard | debate | council
    #[arg(long, default_value = "auto")]
    pub mode: String,

    /// Model id to argue PRO in debate/council mode.
    #[arg(long)]
    pub pro: Option<String>,

    /// Model id to argue CON in debate/council mode.
    #[arg(long)]
    pub con: Option<String>,

    /// Model id to moderate in council mode.
    #[arg(long)]
    pub moderator: Option<String>,

    /// Retrieve and inject CGRAG context before dispatching.
    #[arg(long)]
    pub use_context: bool,
}
