use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::trace::TracerProvider;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "beach-mirror";
const OTEL_STDOUT_ENV: &str = "BEACH_MIRROR_OTEL_STDOUT";
const DEFAULT_DIRECTIVES: &str = "info";

/// Process-wide logging, tracing and metrics. Keep it alive for the life of
/// the process; dropping it flushes the span exporter.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("installing prometheus recorder")?;

        let tracer_provider = env_truthy(OTEL_STDOUT_ENV).then(stdout_tracer_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer())
            .with(otel_layer)
            .try_init()
            .context("installing tracing subscriber")?;

        info!(
            target = "beach_mirror::telemetry",
            otel_stdout = tracer_provider.is_some(),
            "telemetry initialised"
        );
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
        let Some(provider) = self.tracer_provider.take() else {
            return;
        };
        if let Err(err) = provider.shutdown() {
            warn!(
                target = "beach_mirror::telemetry",
                error = %err,
                "tracer provider shutdown failed"
            );
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();
    SdkTracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(resource)
        .build()
}

/// `RUST_LOG` when set and valid, otherwise `info`.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key).is_ok_and(|value| is_truthy(&value))
}

fn is_truthy(value: &str) -> bool {
    ["1", "true", "yes", "on"]
        .iter()
        .any(|accepted| value.trim().eq_ignore_ascii_case(accepted))
}
