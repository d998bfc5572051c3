use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "kernelportd", version, about = "KernelPort ensemble runner")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate an ensemble configuration and print its step order
    Check {
        /// Ensemble configuration (.yaml, .yml or .json)
        #[arg(long)]
        config: PathBuf,

        /// Log level (RUST_LOG)
        #[arg(long, default_value = "warn")]
        log: String,
    },
    /// Run an ensemble against passthrough models
    Run {
        /// Ensemble configuration (.yaml, .yml or .json)
        #[arg(long)]
        config: PathBuf,

        /// Number of concurrent requests
        #[arg(long, default_value_t = 1)]
        requests: usize,

        /// Instances per referenced model
        #[arg(long, default_value_t = 1)]
        instances: usize,

        /// Log level (RUST_LOG)
        #[arg(long, default_value = "info")]
        log: String,
    },
}
