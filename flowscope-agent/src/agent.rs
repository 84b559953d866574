//! Wiring of the collector, the reporter fan-out and the flow log pipeline

use crate::domain_cache::DomainCache;
use crate::endpoint_cache::EndpointCache;
use crate::process_cache::ProcessCache;
use anyhow::{Context, Result};
use flowscope::collector::{self, Collector, CollectorSenders};
use flowscope::config::Config;
use flowscope::flowlog::FlowLogReporter;
use flowscope::metrics::PrometheusExporter;
use flowscope::policy::PolicyStore;
use flowscope::reporter::{ReporterManager, DEFAULT_REPORT_CHANNEL_CAPACITY};
use log::{info, warn};
use prometheus::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Capacity of the conntrack and packet info channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 10_000;

/// Refresh cadence of the metrics textfile.
pub const TEXTFILE_INTERVAL: Duration = Duration::from_secs(15);

/// Resolver state and configuration of a node agent before it starts.
pub struct Agent {
    config: Config,
    endpoints: EndpointCache,
    domains: DomainCache,
    processes: ProcessCache,
    policy_store: PolicyStore,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            endpoints: EndpointCache::new(),
            domains: DomainCache::new(),
            processes: ProcessCache::new(),
            policy_store: PolicyStore::default(),
        }
    }

    pub fn endpoints(&self) -> &EndpointCache {
        &self.endpoints
    }

    pub fn domains(&self) -> &DomainCache {
        &self.domains
    }

    pub fn processes(&self) -> &ProcessCache {
        &self.processes
    }

    pub fn policy_store(&self) -> &PolicyStore {
        &self.policy_store
    }

    /// Spawn the collector and the reporter fan-out. Must be called from
    /// within a tokio runtime.
    pub fn start(self) -> Result<RunningAgent> {
        self.config.validate().context("Invalid configuration")?;

        let (mut manager, report_tx) = ReporterManager::new(DEFAULT_REPORT_CHANNEL_CAPACITY);
        let flow_logs = FlowLogReporter::from_config(&self.config.flow_logs);
        if self.config.flow_logs.file_path.is_none() {
            warn!("No flow log file configured, flow logs are aggregated but not written");
        }
        manager.register(Arc::new(flow_logs.clone()));

        let collector = Collector::new(
            self.config.collector.clone(),
            Arc::new(self.endpoints.clone()),
            report_tx,
        )
        .context("Failed to create collector")?
        .with_domain_cache(Arc::new(self.domains.clone()))
        .with_process_cache(Arc::new(self.processes.clone()))
        .with_policy_store(self.policy_store.clone());
        let registry = collector.metrics_registry();

        let (senders, inputs) = collector::channels(EVENT_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        let reporters = manager.spawn();
        let collector = tokio::spawn(collector.run(inputs, shutdown.clone()));
        let textfile = self.config.prometheus_textfile_path.clone().map(|path| {
            spawn_textfile_writer(
                PrometheusExporter::new(registry.clone()),
                path,
                TEXTFILE_INTERVAL,
                shutdown.clone(),
            )
        });

        info!("Agent started");
        Ok(RunningAgent {
            senders,
            registry,
            flow_logs,
            shutdown,
            collector,
            reporters,
            textfile,
        })
    }
}

/// Handles to a started agent.
pub struct RunningAgent {
    senders: CollectorSenders,
    registry: Registry,
    flow_logs: FlowLogReporter,
    shutdown: CancellationToken,
    collector: JoinHandle<()>,
    reporters: JoinHandle<()>,
    textfile: Option<JoinHandle<()>>,
}

impl RunningAgent {
    /// Channels the dataplane readers feed the collector through.
    pub fn senders(&self) -> &CollectorSenders {
        &self.senders
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn flow_logs(&self) -> &FlowLogReporter {
        &self.flow_logs
    }

    /// Ask the collector to write its stats dump. Returns false when a dump
    /// is already queued.
    pub fn trigger_dump(&self) -> bool {
        self.senders.dump_trigger.try_send(()).is_ok()
    }

    /// Stop the collector, drain the reporter fan-out and flush the flow
    /// log aggregators one last time.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        drop(self.senders);
        self.collector.await.context("Collector task failed")?;
        // The collector held the only report sender, so the fan-out ends
        // once it has delivered the queued updates.
        self.reporters.await.context("Reporter task failed")?;
        self.flow_logs.stop().await;
        if let Some(textfile) = self.textfile {
            textfile.await.context("Textfile writer task failed")?;
        }
        info!("Agent stopped");
        Ok(())
    }
}

/// Rewrite the metrics textfile every `period` until `shutdown` fires.
fn spawn_textfile_writer(
    exporter: PrometheusExporter,
    path: PathBuf,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = exporter.write_textfile(&path) {
                        warn!("Failed to write metrics to {}: {}", path.display(), e);
                    }
                }
            }
        }
    })
}
