//! API server — HTTP REST surface plus the Prometheus exporter.

use crate::handlers::{self, ApiState};
use axum::routing::{get, post};
use axum::Router;
use pulse_core::AppConfig;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    config: AppConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: ApiState) -> Self {
        Self { config, state }
    }

    /// Build the analytics router. Exposed separately from
    /// [`ApiServer::start_http`] so tests can drive it in-process.
    pub fn router(state: ApiState) -> Router {
        Router::new()
            // Events
            .route(
                "/api/v1/analytics/events",
                post(handlers::record_event).get(handlers::query_events),
            )
            // Metrics
            .route("/api/v1/analytics/metrics", post(handlers::save_metric))
            .route(
                "/api/v1/analytics/metrics/{name}",
                get(handlers::metric_series),
            )
            .route(
                "/api/v1/analytics/metrics/{name}/growth",
                get(handlers::metric_growth),
            )
            .route(
                "/api/v1/analytics/metrics/{name}/forecast",
                get(handlers::forecast_metric),
            )
            .route(
                "/api/v1/analytics/metrics/{name}/anomalies",
                get(handlers::detect_anomalies),
            )
            .route(
                "/api/v1/analytics/metrics/{name}/demand",
                post(handlers::predict_demand),
            )
            .route("/api/v1/analytics/top-events", get(handlers::top_events))
            .route(
                "/api/v1/analytics/active-users",
                get(handlers::active_users),
            )
            .route(
                "/api/v1/analytics/conversion-rate",
                get(handlers::conversion_rate),
            )
            .route("/api/v1/analytics/retention", get(handlers::retention))
            // Experiments
            .route(
                "/api/v1/analytics/experiments",
                get(handlers::list_experiments).post(handlers::create_experiment),
            )
            .route(
                "/api/v1/analytics/experiments/{id}",
                get(handlers::get_experiment),
            )
            .route(
                "/api/v1/analytics/experiments/{id}/start",
                post(handlers::start_experiment),
            )
            .route(
                "/api/v1/analytics/experiments/{id}/pause",
                post(handlers::pause_experiment),
            )
            .route(
                "/api/v1/analytics/experiments/{id}/assign",
                post(handlers::assign_variant),
            )
            .route(
                "/api/v1/analytics/experiments/{id}/convert",
                post(handlers::track_conversion),
            )
            .route(
                "/api/v1/analytics/experiments/{id}/results",
                get(handlers::experiment_results),
            )
            .route(
                "/api/v1/analytics/experiments/{id}/winner",
                post(handlers::declare_winner),
            )
            .route(
                "/api/v1/analytics/experiments/{id}/complete",
                post(handlers::complete_experiment),
            )
            // Funnels
            .route(
                "/api/v1/analytics/funnels",
                get(handlers::list_funnels).post(handlers::create_funnel),
            )
            .route("/api/v1/analytics/funnels/{id}", get(handlers::get_funnel))
            .route(
                "/api/v1/analytics/funnels/{id}/track",
                post(handlers::track_funnel_step),
            )
            .route(
                "/api/v1/analytics/funnels/{id}/results",
                get(handlers::funnel_results),
            )
            .route(
                "/api/v1/analytics/funnels/{id}/dropoff",
                get(handlers::funnel_dropoff),
            )
            // Forecasts
            .route(
                "/api/v1/analytics/forecast/revenue",
                post(handlers::predict_revenue),
            )
            .route(
                "/api/v1/analytics/forecast/growth",
                post(handlers::predict_user_growth),
            )
            .route(
                "/api/v1/analytics/predictions/{id}/actual",
                post(handlers::record_actual),
            )
            .route(
                "/api/v1/analytics/predictions/accuracy",
                get(handlers::prediction_accuracy),
            )
            // Operational
            .route("/health", get(handlers::health_check))
            // Middleware
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = Self::router(self.state.clone());

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the metrics exporter on a separate port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        let handle = builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install_recorder()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");

        // Keep the handle alive
        std::mem::forget(handle);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use pulse_core::config::ForecastConfig;
    use pulse_core::types::{Variant, VariantRole};
    use pulse_experiments::{ExperimentConfig, ExperimentManager};
    use pulse_forecast::Forecaster;
    use pulse_funnels::FunnelTracker;
    use pulse_metrics::MetricService;
    use pulse_store::{
        EventRecorder, MemoryEventStore, MemoryExperimentStore, MemoryFunnelStore,
        MemoryMetricStore, MemoryPredictionStore,
    };
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Instant;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn state() -> ApiState {
        let events = Arc::new(MemoryEventStore::new());
        let metric_store = Arc::new(MemoryMetricStore::new());
        ApiState {
            events: Arc::new(EventRecorder::new(events.clone())),
            metrics: Arc::new(MetricService::new(metric_store.clone(), events.clone())),
            experiments: Arc::new(ExperimentManager::new(
                Arc::new(MemoryExperimentStore::new()),
                events.clone(),
            )),
            funnels: Arc::new(FunnelTracker::new(
                Arc::new(MemoryFunnelStore::new()),
                events.clone(),
            )),
            forecaster: Arc::new(Forecaster::new(
                &ForecastConfig::default(),
                metric_store,
                events,
                Arc::new(MemoryPredictionStore::new()),
            )),
            node_id: "test-node".into(),
            start_time: Instant::now(),
        }
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_event_returns_bad_request() {
        let app = ApiServer::router(state());
        let response = app
            .oneshot(post_json(
                "/api/v1/analytics/events",
                serde_json::json!({ "event": "   " }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_experiment_returns_not_found() {
        let app = ApiServer::router(state());
        let uri = format!("/api/v1/analytics/experiments/{}", Uuid::new_v4());
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_assigning_on_draft_experiment_returns_conflict() {
        let state = state();
        let experiment = state
            .experiments
            .create_experiment(ExperimentConfig {
                name: "onboarding-copy".to_string(),
                description: None,
                hypothesis: None,
                variants: vec![
                    Variant {
                        id: "control".to_string(),
                        name: "Current copy".to_string(),
                        role: VariantRole::Control,
                    },
                    Variant {
                        id: "short".to_string(),
                        name: "Short copy".to_string(),
                        role: VariantRole::Treatment,
                    },
                ],
                allocation: HashMap::from([
                    ("control".to_string(), 50.0),
                    ("short".to_string(), 50.0),
                ]),
                metrics: vec![],
                primary_metric: "signup_rate".to_string(),
                traffic_allocation: 1.0,
            })
            .unwrap();

        // Never started, so assignment must be rejected.
        let app = ApiServer::router(state);
        let uri = format!("/api/v1/analytics/experiments/{}/assign", experiment.id);
        let response = app
            .oneshot(post_json(&uri, serde_json::json!({ "user_id": "u1" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
