//! Fan-out of metric updates to registered reporters

use crate::metric::MetricUpdate;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Default capacity of the channel between the collector and the fan-out task.
pub const DEFAULT_REPORT_CHANNEL_CAPACITY: usize = 1000;

#[async_trait]
pub trait Reporter: Send + Sync {
    fn name(&self) -> &str;

    /// Called once by the fan-out task before the first update is delivered.
    async fn start(&self) -> Result<()>;

    async fn report(&self, update: &MetricUpdate) -> Result<()>;
}

/// Delivers every metric update to each registered reporter, in
/// registration order.
pub struct ReporterManager {
    reporters: Vec<Arc<dyn Reporter>>,
    rx: mpsc::Receiver<MetricUpdate>,
}

impl ReporterManager {
    /// Create the manager and the sender the collector reports into.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<MetricUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                reporters: Vec::new(),
                rx,
            },
            tx,
        )
    }

    pub fn register(&mut self, reporter: Arc<dyn Reporter>) {
        info!("Registered reporter {}", reporter.name());
        self.reporters.push(reporter);
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }

    /// Run until every sender has been dropped.
    pub async fn run(mut self) {
        for reporter in &self.reporters {
            if let Err(e) = reporter.start().await {
                error!("Failed to start reporter {}: {}", reporter.name(), e);
            }
        }

        while let Some(update) = self.rx.recv().await {
            for reporter in &self.reporters {
                if let Err(e) = reporter.report(&update).await {
                    error!("Reporter {} failed to process update: {}", reporter.name(), e);
                }
            }
        }
        debug!("Report channel closed, reporter manager exiting");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::FlowscopeError;
    use crate::metric::UpdateType;
    use flowscope_common::Tuple;
    use std::sync::Mutex;

    /// Records every update it receives.
    #[derive(Default)]
    pub struct RecordingReporter {
        pub updates: Mutex<Vec<MetricUpdate>>,
        pub started: Mutex<bool>,
    }

    #[async_trait]
    impl Reporter for RecordingReporter {
        fn name(&self) -> &str {
            "recording"
        }

        async fn start(&self) -> Result<()> {
            *self.started.lock().expect("lock") = true;
            Ok(())
        }

        async fn report(&self, update: &MetricUpdate) -> Result<()> {
            self.updates.lock().expect("lock").push(update.clone());
            Ok(())
        }
    }

    struct FailingReporter;

    #[async_trait]
    impl Reporter for FailingReporter {
        fn name(&self) -> &str {
            "failing"
        }

        async fn start(&self) -> Result<()> {
            Err(FlowscopeError::ReporterFailed {
                name: "failing".to_string(),
                reason: "no sink".to_string(),
            })
        }

        async fn report(&self, _update: &MetricUpdate) -> Result<()> {
            Err(FlowscopeError::ReporterFailed {
                name: "failing".to_string(),
                reason: "no sink".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_failing_reporter_does_not_block_others() {
        let (mut manager, tx) = ReporterManager::new(4);
        let recorder = Arc::new(RecordingReporter::default());
        manager.register(Arc::new(FailingReporter));
        manager.register(recorder.clone());
        assert_eq!(manager.len(), 2);

        let handle = manager.spawn();
        let tuple = Tuple::new([1; 16], [2; 16], 6, 1, 2);
        tx.send(MetricUpdate::new(UpdateType::Report, tuple))
            .await
            .expect("Should send");
        tx.send(MetricUpdate::new(UpdateType::Expire, tuple))
            .await
            .expect("Should send");
        drop(tx);
        handle.await.expect("Manager should exit cleanly");

        assert!(*recorder.started.lock().expect("lock"));
        let updates = recorder.updates.lock().expect("lock");
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].update_type, UpdateType::Expire);
    }
}
