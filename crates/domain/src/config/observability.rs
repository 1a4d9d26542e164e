use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Observability (OpenTelemetry) configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// OpenTelemetry export settings for `tether serve`.
///
/// With no `otlp_endpoint` only the JSON log layer is installed and the
/// `tt_event` trace events go to stdout. Setting it forwards every
/// `tracing` span to an OTLP/gRPC collector as well; everything logged
/// during one inbound turn hangs off its `inbound` span and request id.
///
/// One-shot CLI commands (`ask`, `jobs`, `queue`) never export; they log
/// compactly to stderr.
///
/// ```toml
/// [observability]
/// otlp_endpoint = "http://localhost:4317"
/// service_name  = "tether-home"
/// sample_rate   = 0.25
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// OTLP gRPC endpoint (e.g. `http://localhost:4317`). An exporter
    /// that fails to build is logged and skipped; startup continues.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// The `service.name` resource attribute reported to the collector.
    /// Worth changing when several gateways share one collector.
    #[serde(default = "d_service_name")]
    pub service_name: String,

    /// Trace sampling rate (`0.0` = never, `1.0` = always). Sampling is
    /// decided per trace id, so a turn is exported whole or not at all.
    /// Values outside `0.0..=1.0` fail `Config::validate`.
    #[serde(default = "d_sample_rate")]
    pub sample_rate: f64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: d_service_name(),
            sample_rate: d_sample_rate(),
        }
    }
}

fn d_service_name() -> String {
    "tether".into()
}

fn d_sample_rate() -> f64 {
    1.0
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
