//! Observability infrastructure: tracing, metrics, health checks.
//!
//! This module provides the foundational observability layer for STRATO.
//! All components MUST use this infrastructure from Day 1.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod health;
pub mod metrics;

/// Port the Prometheus exporter listens on.
pub const PORT_DAEMON_METRICS: u16 = 9464;

/// Initialize the global observability infrastructure.
///
/// This must be called once at application startup before any other
/// operations.
///
/// # Panics
/// Panics if called more than once or if initialization fails.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .init();

    // Set up Prometheus metrics exporter
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], PORT_DAEMON_METRICS))
        .install()?;

    // Register core metrics
    metrics::register_core_metrics();

    tracing::info!("Observability initialized (metrics on :{})", PORT_DAEMON_METRICS);
    Ok(())
}
