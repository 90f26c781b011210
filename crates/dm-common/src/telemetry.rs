//! Logging, tracing and metrics export for the deployment manager
//!
//! Logs go to stdout as JSON (or plain text for local runs, via
//! `DM_LOG_FORMAT=text`). Coordinator operations and monitor tasks run in
//! spans carrying the namespace, resource or monitor key they act on. When
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set those spans and the coordinator
//! metrics are exported over OTLP as well.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::{API_GROUP, API_VERSION};

/// Environment variable selecting the log format (`json` or `text`)
pub const LOG_FORMAT_ENV: &str = "DM_LOG_FORMAT";

const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const POD_NAME_ENV: &str = "POD_NAME";
const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";

/// Log filter used when `RUST_LOG` is unset
const DEFAULT_FILTER: &str =
    "info,dm_coordinator=debug,dm_common=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to build OTLP {signal} exporter: {message}")]
    Exporter {
        /// Signal being exported ("traces" or "metrics")
        signal: &'static str,
        /// Exporter error
        message: String,
    },

    /// A telemetry environment variable holds an unsupported value
    #[error("invalid {key}: {message}")]
    Config {
        /// Environment variable name
        key: &'static str,
        /// Description of what's invalid
        message: String,
    },

    /// A global subscriber is already installed
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event, with the current span's fields
    #[default]
    Json,
    /// Human-readable lines
    Text,
}

impl LogFormat {
    /// Parse a `DM_LOG_FORMAT` value
    pub fn parse(value: &str) -> Result<Self, TelemetryError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            other => Err(TelemetryError::Config {
                key: LOG_FORMAT_ENV,
                message: format!("unknown log format {:?}", other),
            }),
        }
    }
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name for traces and metrics
    pub service_name: String,
    /// OTLP collector endpoint; `None` keeps telemetry local
    pub otlp_endpoint: Option<String>,
    /// Log output format
    pub log_format: LogFormat,
    /// Pod running the manager, from the downward API
    pub pod_name: Option<String>,
    /// Namespace the manager runs in, from the downward API
    pub pod_namespace: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "deployment-manager".to_string(),
            otlp_endpoint: None,
            log_format: LogFormat::default(),
            pod_name: None,
            pod_namespace: None,
        }
    }
}

impl TelemetryConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, TelemetryError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TelemetryError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Ok(Self {
            otlp_endpoint: non_empty(OTLP_ENDPOINT_ENV),
            log_format: match lookup(LOG_FORMAT_ENV) {
                Some(raw) => LogFormat::parse(&raw)?,
                None => LogFormat::default(),
            },
            pod_name: non_empty(POD_NAME_ENV),
            pod_namespace: non_empty(POD_NAMESPACE_ENV),
            ..Self::default()
        })
    }
}

/// Install the global subscriber and, if configured, OTLP exporters
///
/// Call once at process startup, before the coordinator is constructed.
///
/// ```ignore
/// use dm_common::telemetry::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig::from_env()?)?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let provider = init_otlp(endpoint, build_resource(&config))?;
            let tracer = provider.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (json_layer, text_layer) = match config.log_format {
        LogFormat::Json => (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            ),
            None,
        ),
        LogFormat::Text => (None, Some(tracing_subscriber::fmt::layer().with_target(true))),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// OpenTelemetry resource describing this manager instance
fn build_resource(config: &TelemetryConfig) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            config.service_name.clone(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
        KeyValue::new("deployment_manager.api", format!("{}/{}", API_GROUP, API_VERSION)),
    ];
    if let Some(pod) = &config.pod_name {
        attributes.push(KeyValue::new("k8s.pod.name", pod.clone()));
    }
    if let Some(namespace) = &config.pod_namespace {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace.clone()));
    }
    Resource::new(attributes)
}

/// Install OTLP trace and metric pipelines, returning the tracer provider
fn init_otlp(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "traces",
            message: e.to_string(),
        })?;
    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "metrics",
            message: e.to_string(),
        })?;

    let meter_provider = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(metric_exporter, runtime::Tokio).build())
        .with_resource(resource.clone())
        .build();
    global::set_meter_provider(meter_provider);

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(span_exporter, runtime::Tokio)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    Ok(tracer_provider)
}
