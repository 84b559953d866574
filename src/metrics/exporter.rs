use crate::Result;
use prometheus::{Registry, TextEncoder};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Renders a registry in the Prometheus text format.
pub struct PrometheusExporter {
    registry: Registry,
}

impl PrometheusExporter {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn render(&self) -> Result<String> {
        let mut buffer = String::new();
        TextEncoder::new().encode_utf8(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Replace `path` atomically so a textfile collector never reads a partial file.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let body = self.render()?;
        let tmp = path.with_extension("prom.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, path)?;
        debug!("Wrote metrics textfile {}", path.display());
        Ok(())
    }
}
