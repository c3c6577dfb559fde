use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `LEARNPULSE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Cadence of the scheduler-driven metric aggregation loop.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_aggregation_enabled")]
    pub enabled: bool,
    #[serde(default = "default_aggregation_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    /// Days of event history feeding revenue/growth baselines.
    #[serde(default = "default_forecast_lookback_days")]
    pub lookback_days: u32,
    /// Days of metric history scanned for anomalies.
    #[serde(default = "default_anomaly_window_days")]
    pub anomaly_window_days: u32,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_aggregation_enabled() -> bool {
    true
}
fn default_aggregation_interval_secs() -> u64 {
    300
}
fn default_forecast_lookback_days() -> u32 {
    90
}
fn default_anomaly_window_days() -> u32 {
    30
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            aggregation: AggregationConfig::default(),
            forecast: ForecastConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            enabled: default_aggregation_enabled(),
            interval_secs: default_aggregation_interval_secs(),
        }
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_forecast_lookback_days(),
            anomaly_window_days: default_anomaly_window_days(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("LEARNPULSE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
