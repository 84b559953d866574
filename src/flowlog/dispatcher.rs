use super::log::FlowLog;
use crate::error::{FlowscopeError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Destination for the flow logs produced by one flush.
#[async_trait]
pub trait LogDispatcher: Send + Sync {
    fn name(&self) -> &str;

    async fn dispatch(&self, logs: Vec<FlowLog>) -> Result<()>;
}

/// Appends one JSON object per line to a file.
#[derive(Debug, Clone)]
pub struct JsonLinesDispatcher {
    name: String,
    path: PathBuf,
}

impl JsonLinesDispatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: format!("file:{}", path.display()),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn failed(&self, reason: impl ToString) -> FlowscopeError {
        FlowscopeError::DispatchFailed {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl LogDispatcher for JsonLinesDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, logs: Vec<FlowLog>) -> Result<()> {
        let mut buf = String::new();
        for log in &logs {
            buf.push_str(&log.to_json_line()?);
            buf.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.failed(e))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| self.failed(e))?;
        file.flush().await.map_err(|e| self.failed(e))?;

        debug!("Wrote {} flow logs to {}", logs.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowlog::aggregator::tests::update;
    use crate::flowlog::{AggregationKind, FlowLogAggregator};
    use crate::metric::UpdateType;
    use crate::rule::RuleAction;

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let dispatcher = JsonLinesDispatcher::new(dir.path().join("flows.log"));

        let mut agg = FlowLogAggregator::new(AggregationKind::Default).include_policies(true);
        agg.feed(&update(UpdateType::Report, 1000, RuleAction::Allow))
            .expect("feed");
        let logs = agg.get_and_calibrate(AggregationKind::Default);
        dispatcher.dispatch(logs.clone()).await.expect("dispatch");
        dispatcher.dispatch(logs).await.expect("dispatch");

        let text = std::fs::read_to_string(dispatcher.path()).expect("Should read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let value: serde_json::Value = serde_json::from_str(lines[0]).expect("valid json");
        assert_eq!(value["action"], "allow");
        assert_eq!(value["reporter"], "dst");
        assert_eq!(value["source_ip"], "10.0.0.1");
        assert_eq!(value["source_port"], 1000);
        assert_eq!(value["packets_in"], 1);
        assert_eq!(value["num_flows_started"], 1);
        assert_eq!(value["source"]["type"], "net");
        assert_eq!(
            value["all_policies"][0],
            "0|tier1|default/tier1.policy1|allow|0"
        );
        assert!(value.get("source_labels").is_none());
    }

    #[tokio::test]
    async fn test_unwritable_path_fails() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let dispatcher = JsonLinesDispatcher::new(dir.path().join("missing").join("flows.log"));
        let err = dispatcher.dispatch(Vec::new()).await.expect_err("Should fail");
        assert!(matches!(err, FlowscopeError::DispatchFailed { .. }));
    }
}
