//! Flow log reporter: feeds aggregators and flushes them periodically

use super::aggregator::FlowLogAggregator;
use super::dispatcher::{JsonLinesDispatcher, LogDispatcher};
use super::meta::FlowAction;
use super::offset::{LogOffset, NoOpLogOffset, PositionsFileLogOffset};
use super::AggregationKind;
use crate::config::FlowLogConfig;
use crate::metric::MetricUpdate;
use crate::reporter::Reporter;
use crate::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Next level from the backpressure signal: coarsen by the suggested factor
/// while behind, otherwise step back one level toward the default.
pub fn next_level(
    current: AggregationKind,
    default: AggregationKind,
    behind: bool,
    increase_factor: i32,
) -> AggregationKind {
    if behind {
        return current.increase(increase_factor.max(1));
    }
    if current > default {
        current.decrease(1)
    } else if current < default {
        current.increase(1)
    } else {
        current
    }
}

#[derive(Clone)]
struct AggregatorSink {
    aggregator: Arc<Mutex<FlowLogAggregator>>,
    dispatchers: Vec<Arc<dyn LogDispatcher>>,
}

/// Feeds every metric update to its aggregators and flushes them to their
/// dispatchers every `flush_interval`.
/// Feeds metric updates to flow log aggregators and flushes them to their
/// dispatchers on a fixed interval. Clones share the same aggregators.
#[derive(Clone)]
pub struct FlowLogReporter {
    sinks: Vec<AggregatorSink>,
    offset: Arc<dyn LogOffset>,
    flush_interval: Duration,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl FlowLogReporter {
    /// Create a reporter without aggregators, flushing every `flush_interval`.
    pub fn new(flush_interval: Duration, offset: Arc<dyn LogOffset>) -> Self {
        Self {
            sinks: Vec::new(),
            offset,
            flush_interval,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Allowed and denied aggregators writing to the configured file, with
    /// the positions file as backpressure signal when set.
    pub fn from_config(config: &FlowLogConfig) -> Self {
        let offset: Arc<dyn LogOffset> = match (&config.positions_file_path, &config.file_path) {
            (Some(positions), Some(file)) => Arc::new(PositionsFileLogOffset::new(
                positions.clone(),
                vec![file.clone()],
                config.behind_threshold_bytes,
            )),
            _ => Arc::new(NoOpLogOffset),
        };
        let dispatchers: Vec<Arc<dyn LogDispatcher>> = match &config.file_path {
            Some(file) => vec![Arc::new(JsonLinesDispatcher::new(file.clone()))],
            None => Vec::new(),
        };

        let mut reporter = Self::new(config.flush_interval(), offset);
        for action in [FlowAction::Allow, FlowAction::Deny] {
            reporter = reporter.with_aggregator(
                FlowLogAggregator::from_config(config, action),
                dispatchers.clone(),
            );
        }
        reporter
    }

    /// Add an aggregator whose flow logs go to `dispatchers`.
    pub fn with_aggregator(
        mut self,
        aggregator: FlowLogAggregator,
        dispatchers: Vec<Arc<dyn LogDispatcher>>,
    ) -> Self {
        self.sinks.push(AggregatorSink {
            aggregator: Arc::new(Mutex::new(aggregator)),
            dispatchers,
        });
        self
    }

    /// Stops the flush loop started by `start`, after a final flush.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel the flush loop and wait for its final flush.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Current level of every aggregator, in registration order.
    pub async fn levels(&self) -> Vec<AggregationKind> {
        let mut levels = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            levels.push(sink.aggregator.lock().await.current_level());
        }
        levels
    }

    /// Flush every aggregator once. The backpressure signal is read once
    /// and applied to all of them. Returns the number of flow logs produced.
    pub async fn flush(&self) -> usize {
        let offsets = self.offset.read();
        let behind = self.offset.is_behind(&offsets);
        let factor = if behind {
            self.offset.increase_factor(&offsets)
        } else {
            0
        };
        if behind {
            info!("Flow log pipeline behind {:?}, increase factor {}", offsets, factor);
        }

        let mut total = 0;
        for sink in &self.sinks {
            let logs = {
                let mut aggregator = sink.aggregator.lock().await;
                let level = next_level(
                    aggregator.current_level(),
                    aggregator.default_level(),
                    behind,
                    factor,
                );
                aggregator.get_and_calibrate(level)
            };
            total += logs.len();
            if logs.is_empty() || sink.dispatchers.is_empty() {
                continue;
            }

            let results = join_all(
                sink.dispatchers
                    .iter()
                    .map(|dispatcher| dispatcher.dispatch(logs.clone())),
            )
            .await;
            for (dispatcher, result) in sink.dispatchers.iter().zip(results) {
                if let Err(e) = result {
                    error!("Dispatcher {} failed: {}", dispatcher.name(), e);
                }
            }
        }
        debug!("Flow log flush produced {} logs", total);
        total
    }

    async fn run_flush_loop(self) {
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.flush().await;
                    info!("Flow log reporter stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }
    }
}

#[async_trait]
impl Reporter for FlowLogReporter {
    fn name(&self) -> &str {
        "flowlog"
    }

    async fn start(&self) -> Result<()> {
        info!(
            "Starting flow log reporter with {} aggregators, flush interval {:?}",
            self.sinks.len(),
            self.flush_interval
        );
        self.tasks.spawn(self.clone().run_flush_loop());
        Ok(())
    }

    async fn report(&self, update: &MetricUpdate) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.aggregator.lock().await.feed(update) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
