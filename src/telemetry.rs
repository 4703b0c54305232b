//! Process-wide tracing setup
//!
//! Console logs are always on. Spans additionally go to an OTLP/gRPC
//! collector when `[telemetry] enabled = true`.

use crate::config::TelemetryConfig;
use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides `log_level`.
///
/// Call once, from inside the Tokio runtime; the span exporter batches on it.
pub fn init_telemetry(config: &TelemetryConfig, log_level: Level) -> Result<()> {
    let provider = span_provider(config)?;
    let otel_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(log_filter(log_level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_file(false)
                .with_line_number(false),
        )
        .with(otel_layer)
        .try_init()
        .context("A tracing subscriber is already installed")?;

    match provider {
        Some(provider) => {
            opentelemetry::global::set_tracer_provider(provider);
            tracing::info!(
                otlp_endpoint = %config.otlp_endpoint,
                service_name = %config.service_name,
                "Exporting spans over OTLP"
            );
        }
        None => tracing::debug!("Span export off"),
    }
    Ok(())
}

/// Flush buffered spans. A no-op when export was never enabled.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

fn log_filter(log_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()))
}

fn span_provider(config: &TelemetryConfig) -> Result<Option<SdkTracerProvider>> {
    if !config.enabled {
        return Ok(None);
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(config.otlp_endpoint.as_str())
        .build()
        .with_context(|| format!("Failed to build OTLP exporter for {}", config.otlp_endpoint))?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]))
        .build();
    Ok(Some(provider))
}
