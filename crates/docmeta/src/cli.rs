use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "docmeta",
    about = "Extract structured metadata from documents with language models",
    version
)]
pub struct Cli {
    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Extract metadata from one or more files
    Extract(ExtractArgs),
    /// List the registered document families
    Families,
}

#[derive(Args)]
pub struct ExtractArgs {
    /// Files to process
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Document family whose pipeline is used
    #[arg(short, long, default_value = "generic")]
    pub family: String,

    /// Document language (defaults to DEFAULT_LANGUAGE, then "en")
    #[arg(short, long)]
    pub language: Option<String>,

    /// Caller-supplied field (key=value); overrides extracted values
    #[arg(short, long = "meta", value_name = "KEY=VALUE")]
    pub meta: Vec<String>,

    /// Include run diagnostics alongside the metadata
    #[arg(long)]
    pub annotate: bool,

    /// Per-file timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Files processed concurrently
    #[arg(short, long, default_value_t = 1)]
    pub jobs: usize,
}
