//! Node agent for flowscope (DaemonSet)
//!
//! Responsibilities:
//! - Hold the endpoint, service, DNS and process state the collector resolves against
//! - Run the collector and hand its metric updates to the flow log pipeline
//! - Write the collector's self-metrics to a Prometheus textfile
//! - Dump the flow table on request

pub mod agent;
pub mod domain_cache;
pub mod endpoint_cache;
pub mod process_cache;

pub use agent::{Agent, RunningAgent};
pub use domain_cache::DomainCache;
pub use endpoint_cache::{Cidr, EndpointCache};
pub use process_cache::ProcessCache;
