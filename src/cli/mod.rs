pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "apiplane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Extensible control-plane API server with runtime third-party resources", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the API server")]
    Serve {
        #[arg(short, long, help = "Path to a YAML configuration file")]
        config: Option<PathBuf>,

        #[arg(short, long, help = "Address to listen on, overrides the configuration")]
        bind: Option<String>,
    },
    #[command(about = "Print the default configuration as YAML")]
    Config,
    #[command(about = "Validate a configuration file")]
    Check {
        #[arg(help = "Path to a YAML configuration file")]
        config: PathBuf,
    },
}
