//! Command-line argument parsing

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "image-mover")]
#[command(about = "Download a container image artifact and push it to a registry")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(long, short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Quiet mode
    #[arg(
        long,
        short = 'q',
        global = true,
        conflicts_with = "verbose",
        help = "Suppress progress output"
    )]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Move the image at URL to TARGET_REPO under TAG
    Move(MoveArgs),
    /// Run an invocation payload: {"body": "{\"url\": ..., \"tag\": ...}"}
    Invoke(InvokeArgs),
}

#[derive(Debug, Args)]
pub struct MoveArgs {
    #[arg(long, help = "URL of the image artifact to download")]
    pub url: String,

    #[arg(long, help = "Destination tag")]
    pub tag: String,
}

#[derive(Debug, Args)]
pub struct InvokeArgs {
    /// JSON payload; read from stdin when omitted
    pub payload: Option<String>,
}
