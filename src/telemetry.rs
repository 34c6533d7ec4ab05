use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize structured logging.
///
/// `RUST_LOG` wins over the configured level when it is set.
pub fn init_telemetry(observability: &ObservabilityConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&observability.log_level)?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    if observability.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()?;
    }

    tracing::info!("optiline telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping the whole life of one process instance
pub fn create_process_span(
    instance_id: &Uuid,
    template_id: &str,
    batch_id: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "process_instance",
        instance.id = %instance_id,
        template.id = template_id,
        batch.id = batch_id,
        otel.kind = "internal"
    )
}

/// Span wrapping one alignment run
pub fn create_alignment_span(strategy: &str, correlation_id: Option<&str>) -> tracing::Span {
    tracing::info_span!(
        "alignment_run",
        strategy = strategy,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}

/// Shutdown telemetry gracefully
pub fn shutdown_telemetry() {
    tracing::info!("optiline telemetry shutdown complete");
}
