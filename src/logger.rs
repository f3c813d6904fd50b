use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

const SERVICE_NAME: &str = "stepmesh";

/// Target of the one-line-per-conversion JSON report.
pub const REPORT_TARGET: &str = "stepmesh::report";

/// Providers that must be flushed before the process exits.
#[derive(Default)]
pub struct Telemetry {
    logger_provider: Option<SdkLoggerProvider>,
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    pub fn shutdown(self) {
        if let Some(provider) = self.logger_provider {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.tracer_provider {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.meter_provider {
            let _ = provider.shutdown();
        }
    }
}

/// Installs the global subscriber.
///
/// Human readable output always goes to stderr; stdout is reserved for the
/// stdio protocol. With an OTLP endpoint, logs, spans and metrics are also
/// exported over OTLP/HTTP. Otherwise, with a log directory, a daily rolling
/// text log and a JSON conversion report are written there.
pub fn init_tracing(log_level: &str, log_dir: Option<&Path>, otel_endpoint: Option<&str>) -> Result<Telemetry> {
    let filter = || EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let mut layers: Vec<BoxedLayer> = vec![
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .with_filter(filter())
            .boxed(),
    ];
    let mut telemetry = Telemetry::default();

    if let Some(endpoint) = otel_endpoint {
        let logger_provider = init_logs(endpoint)?;
        let tracer_provider = init_traces(endpoint)?;
        let meter_provider = init_metrics(endpoint)?;

        layers.push(
            OpenTelemetryTracingBridge::new(&logger_provider)
                .with_filter(
                    filter()
                        .add_directive("hyper=off".parse()?)
                        .add_directive("tonic=off".parse()?)
                        .add_directive("h2=off".parse()?)
                        .add_directive("reqwest=off".parse()?),
                )
                .boxed(),
        );
        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        telemetry = Telemetry {
            logger_provider: Some(logger_provider),
            tracer_provider: Some(tracer_provider),
            meter_provider: Some(meter_provider),
        };
    } else if let Some(dir) = log_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log dir {}", dir.display()))?;
        layers.push(
            fmt::layer()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, "stepmesh.log"))
                .with_ansi(false)
                .with_filter(filter())
                .boxed(),
        );
        layers.push(
            fmt::layer()
                .json()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, "conversions.json"))
                .with_target(true)
                .with_filter(EnvFilter::new(format!("{REPORT_TARGET}=info")))
                .boxed(),
        );
    }

    Registry::default()
        .with(layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(telemetry)
}

fn resource() -> Resource {
    static RESOURCE: OnceLock<Resource> = OnceLock::new();
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("Failed to build OTLP log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource())
        .build())
}

fn init_traces(endpoint: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("Failed to build OTLP span exporter")?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource())
        .build())
}

fn init_metrics(endpoint: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("Failed to build OTLP metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource())
        .build())
}

/// Counters and latency for conversions run by a worker. Records into
/// whatever meter provider is installed globally (a no-op by default).
#[derive(Clone)]
pub struct ConversionMetrics {
    started: Counter<u64>,
    succeeded: Counter<u64>,
    failed: Counter<u64>,
    latency_ms: Histogram<f64>,
}

impl ConversionMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            started: meter
                .u64_counter("conversions_started")
                .with_description("Conversions handed to the foreign module")
                .build(),
            succeeded: meter.u64_counter("conversions_succeeded").build(),
            failed: meter.u64_counter("conversions_failed").build(),
            latency_ms: meter
                .f64_histogram("conversion_latency_ms")
                .with_description("Time from accepting a request to its final message")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn started(&self) {
        self.started.add(1, &[]);
    }

    pub fn finished(&self, succeeded: bool, elapsed: Duration) {
        let latency_ms = elapsed.as_secs_f64() * 1_000.0;
        self.latency_ms.record(latency_ms, &[]);
        if succeeded {
            self.succeeded.add(1, &[]);
        } else {
            self.failed.add(1, &[]);
        }
        tracing::event!(
            target: REPORT_TARGET,
            tracing::Level::INFO,
            latency_ms,
            status = if succeeded { "ok" } else { "error" },
        );
    }
}

impl Default for ConversionMetrics {
    fn default() -> Self {
        Self::new()
    }
}
