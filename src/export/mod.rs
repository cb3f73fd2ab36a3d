pub mod health;

use anyhow::{Context, Result};
use prometheus::{Encoder, Registry, TextEncoder};

/// Renders a registry in the Prometheus text exposition format.
pub fn render_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("metrics exposition is not UTF-8")
}
