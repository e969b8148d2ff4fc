use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "chatline-gateway";
pub const OTEL_STDOUT_ENV: &str = "CHATLINE_OTEL_STDOUT";

const COUNTERS: &[(&str, &str)] = &[
    ("chatline_messages_sent_total", "Outbound messages accepted by a session."),
    ("chatline_send_failures_total", "Outbound sends rejected, by cause."),
    ("chatline_rate_limited_total", "Token bucket rejections."),
    ("chatline_sessions_paused_total", "Sessions paused, by reason."),
    ("chatline_reconnect_attempts_total", "Scheduled reconnect attempts."),
    ("chatline_qr_issued_total", "Pairing codes forwarded to observers."),
    ("chatline_inbound_enqueued_total", "Inbound messages pushed to the work queue."),
    ("chatline_inbound_dropped_total", "Inbound messages dropped, by cause."),
    ("chatline_observer_events_skipped_total", "Events skipped by lagging observers."),
];

/// Process-wide tracing subscriber, metrics recorder and optional span exporter.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = install_metrics()?;
        let tracer_provider = if env_truthy(OTEL_STDOUT_ENV) {
            Some(span_exporter())
        } else {
            None
        };

        let registry = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false));
        match &tracer_provider {
            Some(provider) => {
                global::set_tracer_provider(provider.clone());
                registry
                    .with(tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME)))
                    .try_init()
            }
            None => registry.try_init(),
        }
        .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn metrics_builder() -> PrometheusBuilder {
    PrometheusBuilder::new().add_global_label("service", SERVICE_NAME)
}

/// Installs the global recorder and describes the gateway's series.
fn install_metrics() -> Result<PrometheusHandle> {
    let handle = metrics_builder()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;
    for (name, help) in COUNTERS {
        describe_counter!((*name), (*help));
    }
    describe_gauge!(
        "chatline_observers_active",
        "Event stream observers currently attached."
    );
    Ok(handle)
}

fn span_exporter() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

pub fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|val| is_truthy(&val))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
