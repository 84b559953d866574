use crate::cli::Commands;
use crate::collector::dump::{summarize_dump, DumpSummary};
use crate::config::Config;
use crate::flowlog::AggregationKind;
use crate::Result;
use std::path::Path;
use tracing::info;

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Config { file } => handle_config(&file),
        Commands::Defaults => handle_defaults(),
        Commands::DumpSummary { file } => handle_dump_summary(&file),
        Commands::Levels => {
            print!("{}", render_levels());
            Ok(())
        }
    }
}

fn handle_config(file: &Path) -> Result<()> {
    info!("Loading configuration from {}", file.display());
    let config = Config::load(file)?;
    println!("# Effective configuration for {}", file.display());
    print!("{}", config.to_yaml()?);
    Ok(())
}

fn handle_defaults() -> Result<()> {
    print!("{}", Config::default().to_yaml()?);
    Ok(())
}

fn handle_dump_summary(file: &Path) -> Result<()> {
    info!("Reading stats dump {}", file.display());
    let contents = std::fs::read_to_string(file)?;
    print!("{}", render_summary(&summarize_dump(&contents)));
    Ok(())
}

fn render_summary(summary: &DumpSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Started:   {}\n",
        summary.started.as_deref().unwrap_or("-")
    ));
    out.push_str(&format!(
        "Completed: {}\n",
        summary.completed.as_deref().unwrap_or("(incomplete)")
    ));
    match summary.declared_entries {
        Some(declared) if declared != summary.records => out.push_str(&format!(
            "Records:   {} (header declares {})\n",
            summary.records, declared
        )),
        _ => out.push_str(&format!("Records:   {}\n", summary.records)),
    }
    out
}

fn render_levels() -> String {
    AggregationKind::ALL
        .iter()
        .map(|kind| format!("{}  {:<14} {}\n", kind.level(), kind.as_str(), kind.description()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_levels_lists_all() {
        let text = render_levels();
        assert_eq!(text.lines().count(), 4);
        assert!(text.starts_with("0  default"));
        assert!(text.contains("3  no-dest-ports"));
    }

    #[test]
    fn test_render_summary_flags_mismatch() {
        let summary = DumpSummary {
            started: Some("1.000".to_string()),
            completed: None,
            declared_entries: Some(3),
            records: 2,
        };
        let text = render_summary(&summary);
        assert!(text.contains("(incomplete)"));
        assert!(text.contains("Records:   2 (header declares 3)"));
    }

    #[tokio::test]
    async fn test_config_command_rejects_invalid_file() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "flow_logs:\n  flush_interval_secs: 0\n").expect("write");
        assert!(handle_command(Commands::Config { file: path }).await.is_err());
    }
}
