pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flowscope")]
#[command(author = "flowscope developers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Flow state aggregation and adaptive flow log tooling", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Load, validate and print a configuration file")]
    Config {
        #[arg(short, long, help = "Path to the YAML configuration")]
        file: PathBuf,
    },
    #[command(about = "Print the default configuration as YAML")]
    Defaults,
    #[command(about = "Summarize a flow table stats dump")]
    DumpSummary {
        #[arg(short, long, help = "Path to the stats dump")]
        file: PathBuf,
    },
    #[command(about = "List the flow log aggregation levels")]
    Levels,
}
