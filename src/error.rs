use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowscopeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Malformed dataplane statistics: {0}")]
    MalformedStatistics(String),

    #[error("Invalid metric update: {0}")]
    InvalidMetricUpdate(String),

    #[error("Endpoint metadata unavailable for {address}: {reason}")]
    EndpointMetadata { address: String, reason: String },

    #[error("Reporter {name} failed: {reason}")]
    ReporterFailed { name: String, reason: String },

    #[error("Dispatcher {name} failed: {reason}")]
    DispatchFailed { name: String, reason: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

pub type Result<T> = std::result::Result<T, FlowscopeError>;
