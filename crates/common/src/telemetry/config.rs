use opentelemetry_sdk::{logs::LoggerProvider, trace::TracerProvider as SdkTracerProvider};

/// Logging and OpenTelemetry export settings
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub otel_endpoint: String,
    pub otel_enabled: bool,
    /// Fraction of traces exported, clamped to `0.0..=1.0`
    pub trace_sample_ratio: f64,
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "heatline".to_string(),
            otel_endpoint: "http://localhost:4317".to_string(),
            otel_enabled: false,
            trace_sample_ratio: 1.0,
            log_level: "info".to_string(),
        }
    }
}

/// Providers returned from telemetry initialization for proper shutdown
pub struct TelemetryProviders {
    pub tracer_provider: SdkTracerProvider,
    pub logger_provider: LoggerProvider,
}
