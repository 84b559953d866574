use anyhow::Context;
use clap::Parser;
use flowscope::cli::{commands, Cli};
use std::process;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting flowscope v{}", flowscope::VERSION);

    match cli.command {
        Some(command) => commands::handle_command(command)
            .await
            .context("Command failed")?,
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            process::exit(1);
        }
    }
    Ok(())
}
