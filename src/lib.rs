pub mod cli;
pub mod collector;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod flowlog;
pub mod lookup;
pub mod metric;
pub mod metrics;
pub mod policy;
pub mod process;
pub mod reporter;
pub mod rule;

pub use error::{FlowscopeError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
