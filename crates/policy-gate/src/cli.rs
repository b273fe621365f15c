use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "policy-gate",
    version,
    about = "Validate policy bundles and evaluate access requests against them"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load a bundle and report every validation error
    Validate {
        /// Path to the policy bundle (overrides config file setting)
        #[arg(short, long)]
        bundle: Option<PathBuf>,
    },
    /// Evaluate JSON requests and print one JSON result per request
    Eval {
        /// Path to the policy bundle (overrides config file setting)
        #[arg(short, long)]
        bundle: Option<PathBuf>,

        /// File holding a single JSON request; `-` or absent reads
        /// JSON lines from stdin
        #[arg(short, long)]
        request: Option<PathBuf>,

        /// Include the matched rules and binding order in every result
        #[arg(long)]
        explain: bool,
    },
}

impl Command {
    pub fn bundle_override(&self) -> Option<&PathBuf> {
        match self {
            Command::Validate { bundle } | Command::Eval { bundle, .. } => bundle.as_ref(),
        }
    }
}
