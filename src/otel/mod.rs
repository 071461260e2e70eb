//! OpenTelemetry integration for sienge-sync
//!
//! This module provides observability through OpenTelemetry, including
//! tracing, metrics, and optional export to OTLP endpoints.

use crate::config::{LoggingConfig, OtelConfig};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, MeterProvider as _},
    trace::TracerProvider as TracerProviderTrait,
    KeyValue,
};
use opentelemetry_sdk::{metrics::SdkMeterProvider, trace::TracerProvider, Resource};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// OpenTelemetry error types
#[derive(Debug, Error)]
pub enum OtelError {
    /// Failed to initialize tracer
    #[error("Failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize meter
    #[error("Failed to initialize meter: {0}")]
    MeterInit(String),

    /// Failed to shutdown
    #[error("Failed to shutdown: {0}")]
    Shutdown(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// OpenTelemetry provider
///
/// Manages tracing and metrics providers with OTLP export capability.
pub struct OtelProvider {
    tracer_provider: Option<TracerProvider>,
    meter_provider: SdkMeterProvider,
    config: OtelConfig,
}

impl OtelProvider {
    /// Create a new OtelProvider with the given configuration
    pub fn new(config: &OtelConfig) -> Result<Self, OtelError> {
        let resource = Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]);

        let (tracer_provider, meter_provider) = if config.enabled {
            let endpoint = config.endpoint.as_ref().ok_or_else(|| {
                OtelError::Config("OTLP endpoint is required when enabled".into())
            })?;

            let tracer_provider = Self::init_tracer_provider(endpoint, &resource)?;
            let meter_provider = Self::init_meter_provider(endpoint, &resource)?;

            (Some(tracer_provider), meter_provider)
        } else {
            // Metrics still work in-process, nothing is exported
            let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
            (None, meter_provider)
        };

        if let Some(ref tp) = tracer_provider {
            global::set_tracer_provider(tp.clone());
        }

        Ok(Self {
            tracer_provider,
            meter_provider,
            config: config.clone(),
        })
    }

    fn init_tracer_provider(
        endpoint: &str,
        resource: &Resource,
    ) -> Result<TracerProvider, OtelError> {
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::runtime;
        use opentelemetry_sdk::trace::{Config, Sampler};

        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint)
            .build_span_exporter()
            .map_err(|e| OtelError::TracerInit(e.to_string()))?;

        let trace_config = Config::default()
            .with_sampler(Sampler::AlwaysOn)
            .with_resource(resource.clone());

        Ok(TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_config(trace_config)
            .build())
    }

    fn init_meter_provider(
        endpoint: &str,
        resource: &Resource,
    ) -> Result<SdkMeterProvider, OtelError> {
        use opentelemetry_otlp::{MetricsExporterBuilder, WithExportConfig};
        use opentelemetry_sdk::metrics::reader::{
            DefaultAggregationSelector, DefaultTemporalitySelector,
        };
        use opentelemetry_sdk::{metrics::PeriodicReader, runtime};

        let exporter = MetricsExporterBuilder::from(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .build_metrics_exporter(
            Box::new(DefaultTemporalitySelector::new()),
            Box::new(DefaultAggregationSelector::new()),
        )
        .map_err(|e| OtelError::MeterInit(e.to_string()))?;

        let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();

        Ok(SdkMeterProvider::builder()
            .with_resource(resource.clone())
            .with_reader(reader)
            .build())
    }

    /// Get a tracer from the provider
    pub fn tracer(&self, name: &'static str) -> opentelemetry_sdk::trace::Tracer {
        match self.tracer_provider {
            Some(ref tp) => tp.tracer(name),
            None => TracerProvider::builder().build().tracer(name),
        }
    }

    /// Get the meter for creating metrics
    pub fn meter(&self) -> Meter {
        self.meter_provider.meter(self.config.service_name.clone())
    }

    /// Check if OpenTelemetry export is enabled
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Shutdown the OpenTelemetry providers gracefully
    pub fn shutdown(&self) -> Result<(), OtelError> {
        if let Err(e) = self.meter_provider.shutdown() {
            return Err(OtelError::Shutdown(format!(
                "Meter shutdown failed: {:?}",
                e
            )));
        }

        if let Some(ref tp) = self.tracer_provider {
            for result in tp.force_flush() {
                if let Err(e) = result {
                    return Err(OtelError::Shutdown(format!("Tracer flush failed: {:?}", e)));
                }
            }
        }

        Ok(())
    }
}

impl Drop for OtelProvider {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Application metrics
///
/// Instruments for upstream traffic, entity synchronization and the
/// credential validation cache.
pub struct Metrics {
    /// Upstream API calls, labelled by method and outcome
    pub api_calls_total: Counter<u64>,

    /// Retries scheduled after a transient failure
    pub retries_total: Counter<u64>,

    /// Entity sync outcomes, labelled by entity and outcome
    pub entity_syncs_total: Counter<u64>,

    /// Records fetched per entity
    pub records_fetched_total: Counter<u64>,

    /// Validation cache hits
    pub cache_hits_total: Counter<u64>,

    /// Validation cache misses
    pub cache_misses_total: Counter<u64>,

    /// Upstream request duration in seconds
    pub upstream_duration: Histogram<f64>,

    /// Whole-run duration in seconds
    pub run_duration: Histogram<f64>,
}

impl Metrics {
    /// Create new metrics with the given meter
    pub fn new(meter: &Meter) -> Self {
        Self {
            api_calls_total: meter
                .u64_counter("sienge_sync_api_calls_total")
                .with_description("Total number of upstream API calls")
                .init(),
            retries_total: meter
                .u64_counter("sienge_sync_retries_total")
                .with_description("Total number of retried upstream calls")
                .init(),
            entity_syncs_total: meter
                .u64_counter("sienge_sync_entity_syncs_total")
                .with_description("Entity synchronizations by outcome")
                .init(),
            records_fetched_total: meter
                .u64_counter("sienge_sync_records_fetched_total")
                .with_description("Records fetched from the upstream API")
                .init(),
            cache_hits_total: meter
                .u64_counter("sienge_sync_validation_cache_hits_total")
                .with_description("Credential validation cache hits")
                .init(),
            cache_misses_total: meter
                .u64_counter("sienge_sync_validation_cache_misses_total")
                .with_description("Credential validation cache misses")
                .init(),
            upstream_duration: meter
                .f64_histogram("sienge_sync_upstream_duration_seconds")
                .with_description("Upstream request duration in seconds")
                .init(),
            run_duration: meter
                .f64_histogram("sienge_sync_run_duration_seconds")
                .with_description("Sync run duration in seconds")
                .init(),
        }
    }

    /// Record one upstream call
    pub fn record_api_call(&self, method: &str, outcome: &str, duration_secs: f64) {
        let attributes = [
            KeyValue::new("method", method.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ];
        self.api_calls_total.add(1, &attributes);
        self.upstream_duration.record(duration_secs, &attributes);
    }

    /// Record a scheduled retry
    pub fn record_retry(&self, method: &str) {
        self.retries_total
            .add(1, &[KeyValue::new("method", method.to_string())]);
    }

    /// Record the outcome of one entity within a run
    pub fn record_entity(&self, entity: &str, outcome: &str, records: u64) {
        let entity = KeyValue::new("entity", entity.to_string());
        self.entity_syncs_total.add(
            1,
            &[entity.clone(), KeyValue::new("outcome", outcome.to_string())],
        );
        self.records_fetched_total.add(records, &[entity]);
    }

    /// Record a finished run
    pub fn record_run(&self, status: &str, duration_secs: f64) {
        self.run_duration
            .record(duration_secs, &[KeyValue::new("status", status.to_string())]);
    }

    /// Record a validation cache hit
    pub fn record_cache_hit(&self) {
        self.cache_hits_total.add(1, &[]);
    }

    /// Record a validation cache miss
    pub fn record_cache_miss(&self) {
        self.cache_misses_total.add(1, &[]);
    }
}

/// Initialize the tracing subscriber
///
/// `RUST_LOG` takes precedence over `logging.level` when set. Output is JSON
/// unless `logging.format` is `pretty`.
pub fn init_tracing(otel: &OtelProvider, logging: &LoggingConfig) -> Result<(), OtelError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| OtelError::Config(format!("invalid log level '{}': {}", logging.level, e)))?;

    let fmt_layer = match logging.format.as_str() {
        "pretty" => tracing_subscriber::fmt::layer().pretty().boxed(),
        _ => tracing_subscriber::fmt::layer().json().boxed(),
    };

    let otel_layer = otel
        .is_enabled()
        .then(|| tracing_opentelemetry::layer().with_tracer(otel.tracer("sienge-sync")));

    tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| OtelError::TracerInit(e.to_string()))
}
