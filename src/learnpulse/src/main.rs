//! LearnPulse — analytics and experimentation engine.
//!
//! Main entry point that wires the stores and services and starts the
//! API server.

use clap::Parser;
use pulse_api::{ApiServer, ApiState};
use pulse_core::types::{MetricPeriod, ORDER_COMPLETED_EVENT, SIGNUP_EVENT};
use pulse_core::AppConfig;
use pulse_experiments::ExperimentManager;
use pulse_forecast::Forecaster;
use pulse_funnels::FunnelTracker;
use pulse_metrics::{AggregationRule, MetricAggregator, MetricService};
use pulse_store::{
    EventRecorder, MemoryEventStore, MemoryExperimentStore, MemoryFunnelStore, MemoryMetricStore,
    MemoryPredictionStore,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "learnpulse")]
#[command(about = "Analytics and experimentation engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "LEARNPULSE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "LEARNPULSE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Disable the periodic metric aggregation loop (API-only mode)
    #[arg(long, default_value_t = false)]
    no_aggregation: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "learnpulse=info,pulse_store=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("LearnPulse starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if cli.no_aggregation {
        config.aggregation.enabled = false;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        aggregation = config.aggregation.enabled,
        "Configuration loaded"
    );

    // In-memory stores
    let event_store = Arc::new(MemoryEventStore::new());
    let metric_store = Arc::new(MemoryMetricStore::new());
    let experiment_store = Arc::new(MemoryExperimentStore::new());
    let funnel_store = Arc::new(MemoryFunnelStore::new());
    let prediction_store = Arc::new(MemoryPredictionStore::new());

    // Services
    let recorder = Arc::new(EventRecorder::new(event_store.clone()));
    let metric_service = Arc::new(MetricService::new(metric_store.clone(), event_store.clone()));
    let experiments = Arc::new(ExperimentManager::new(
        experiment_store.clone(),
        event_store.clone(),
    ));
    let funnels = Arc::new(FunnelTracker::new(funnel_store.clone(), event_store.clone()));
    let forecaster = Arc::new(Forecaster::new(
        &config.forecast,
        metric_store.clone(),
        event_store.clone(),
        prediction_store.clone(),
    ));

    // Periodic event roll-up into hourly and daily metrics
    if config.aggregation.enabled {
        let aggregator = Arc::new(MetricAggregator::new(
            metric_service.clone(),
            event_store.clone(),
        ));
        aggregator.register(AggregationRule {
            metric: "signups_daily".to_string(),
            event: SIGNUP_EVENT.to_string(),
            period: MetricPeriod::Daily,
        });
        aggregator.register(AggregationRule {
            metric: "orders_daily".to_string(),
            event: ORDER_COMPLETED_EVENT.to_string(),
            period: MetricPeriod::Daily,
        });
        aggregator.register(AggregationRule {
            metric: "orders_hourly".to_string(),
            event: ORDER_COMPLETED_EVENT.to_string(),
            period: MetricPeriod::Hourly,
        });

        let interval_secs = config.aggregation.interval_secs;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                for period in [MetricPeriod::Hourly, MetricPeriod::Daily] {
                    if let Err(e) = aggregator.run(period) {
                        error!(error = %e, period = period.as_str(), "Aggregation run failed");
                    }
                }
            }
        });
        info!(interval_secs, "Aggregation loop started");
    } else {
        info!("Running in API-only mode (no aggregation loop)");
    }

    let state = ApiState {
        events: recorder,
        metrics: metric_service,
        experiments,
        funnels,
        forecaster,
        node_id: config.node_id.clone(),
        start_time: Instant::now(),
    };

    let api_server = ApiServer::new(config.clone(), state);

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("LearnPulse is ready to serve traffic");

    // Start HTTP server (blocks until shutdown)
    api_server.start_http().await?;

    Ok(())
}
