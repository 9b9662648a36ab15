//! Tracing subscriber setup.
//!
//! Console output goes to stderr so command output on stdout stays
//! parseable. `PEERLOOP_LOG` takes an `EnvFilter` directive and
//! `PEERLOOP_LOG_FORMAT` picks `json`, `compact` or the default full format.
//! With the `otel` feature, spans and log events are also exported over
//! OTLP/HTTP whenever `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOG_ENV: &str = "PEERLOOP_LOG";
const FORMAT_ENV: &str = "PEERLOOP_LOG_FORMAT";
const DEFAULT_FILTER: &str = "peerloop=info,warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Full,
    Compact,
    Json,
}

impl LogFormat {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("json") => LogFormat::Json,
            Some("compact") => LogFormat::Compact,
            _ => LogFormat::Full,
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn console_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Full => layer.boxed(),
    }
}

/// Keeps exporters alive; dropping it flushes pending telemetry.
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    tracer: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
    #[cfg(feature = "otel")]
    logger: Option<opentelemetry_sdk::logs::SdkLoggerProvider>,
}

/// Install the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init() -> TelemetryGuard {
    let format = LogFormat::parse(std::env::var(FORMAT_ENV).ok().as_deref());

    #[cfg(feature = "otel")]
    {
        init_with_otlp(format)
    }

    #[cfg(not(feature = "otel"))]
    {
        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(console_layer(format))
            .try_init();
        TelemetryGuard {}
    }
}

#[cfg(feature = "otel")]
fn init_with_otlp(format: LogFormat) -> TelemetryGuard {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
    use tracing_subscriber::filter::filter_fn;

    let (tracer, logger) = if otlp::enabled() {
        match (otlp::tracer_provider(), otlp::logger_provider()) {
            (Ok(tracer), Ok(logger)) => (Some(tracer), Some(logger)),
            (Err(e), _) | (_, Err(e)) => {
                eprintln!("warning: OTLP export disabled: {e:#}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let trace_layer = tracer
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(env!("CARGO_PKG_NAME"))));
    // The exporter's own HTTP client logs through tracing too.
    let log_layer = logger.as_ref().map(|p| {
        OpenTelemetryTracingBridge::new(p).with_filter(filter_fn(|meta| {
            let target = meta.target();
            !(target.starts_with("opentelemetry")
                || target.starts_with("reqwest")
                || target.starts_with("hyper"))
        }))
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(console_layer(format))
        .with(trace_layer)
        .with(log_layer)
        .try_init();

    TelemetryGuard { tracer, logger }
}

#[cfg(feature = "otel")]
mod otlp {
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::logs::SdkLoggerProvider;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    pub(super) fn enabled() -> bool {
        std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok_and(|v| !v.trim().is_empty())
    }

    fn resource() -> Resource {
        Resource::builder()
            .with_service_name(env!("CARGO_PKG_NAME"))
            .build()
    }

    pub(super) fn tracer_provider() -> anyhow::Result<SdkTracerProvider> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .build()?;
        Ok(SdkTracerProvider::builder()
            .with_resource(resource())
            .with_batch_exporter(exporter)
            .build())
    }

    pub(super) fn logger_provider() -> anyhow::Result<SdkLoggerProvider> {
        let exporter = opentelemetry_otlp::LogExporter::builder()
            .with_http()
            .build()?;
        Ok(SdkLoggerProvider::builder()
            .with_resource(resource())
            .with_batch_exporter(exporter)
            .build())
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        {
            if let Some(tracer) = self.tracer.take()
                && let Err(e) = tracer.shutdown()
            {
                eprintln!("failed to shut down trace exporter: {e}");
            }
            if let Some(logger) = self.logger.take()
                && let Err(e) = logger.shutdown()
            {
                eprintln!("failed to shut down log exporter: {e}");
            }
        }
    }
}
