//! Axum REST handlers for the analytics API.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use pulse_core::types::{
    AnalyticsEvent, Experiment, ExperimentResults, Funnel, Metric, MetricPeriod, Prediction,
    PredictionType,
};
use pulse_core::AnalyticsError;
use pulse_experiments::{ExperimentConfig, ExperimentManager};
use pulse_forecast::{AnomalyPoint, ForecastPoint, Forecaster};
use pulse_funnels::{DropoffAnalysis, FunnelConfig, FunnelTracker, StepResult};
use pulse_metrics::{EventCount, MetricService, MetricWrite};
use pulse_store::{EventData, EventQuery, EventRecorder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Shared handler state: one `Arc` per service.
#[derive(Clone)]
pub struct ApiState {
    pub events: Arc<EventRecorder>,
    pub metrics: Arc<MetricService>,
    pub experiments: Arc<ExperimentManager>,
    pub funnels: Arc<FunnelTracker>,
    pub forecaster: Arc<Forecaster>,
    pub node_id: String,
    pub start_time: Instant,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn map_err(err: AnalyticsError) -> ApiError {
    let (status, code) = match &err {
        AnalyticsError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
        AnalyticsError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        AnalyticsError::NotRunning(_) => (StatusCode::CONFLICT, "not_running"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: err.to_string(),
        }),
    )
}

// ─── Health ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub node_id: String,
    pub uptime_secs: u64,
}

pub async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

// ─── Events ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventQueryParams {
    pub event: Option<String>,
    pub user_id: Option<String>,
    pub category: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

pub async fn record_event(
    State(state): State<ApiState>,
    Json(data): Json<EventData>,
) -> Result<(StatusCode, Json<AnalyticsEvent>), ApiError> {
    let event = state.events.record(data).map_err(map_err)?;
    Ok((StatusCode::CREATED, Json(event)))
}

pub async fn query_events(
    State(state): State<ApiState>,
    Query(params): Query<EventQueryParams>,
) -> ApiResult<Vec<AnalyticsEvent>> {
    let query = EventQuery {
        event: params.event,
        user_id: params.user_id,
        category: params.category,
        start: params.start,
        end: params.end,
        limit: params.limit,
    };
    state.events.query(&query).map(Json).map_err(map_err)
}

// ─── Metrics ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SaveMetricRequest {
    pub name: String,
    pub value: f64,
    pub period: MetricPeriod,
    pub target: Option<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct SeriesParams {
    pub period: Option<MetricPeriod>,
    pub days: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TopEventsParams {
    pub limit: Option<usize>,
    pub days: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ActiveUsersParams {
    pub period: Option<MetricPeriod>,
}

#[derive(Debug, Deserialize)]
pub struct ConversionRateParams {
    pub from_event: String,
    pub to_event: String,
    pub window_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RetentionParams {
    pub cohort_start: DateTime<Utc>,
    pub cohort_end: DateTime<Utc>,
}

const DEFAULT_SERIES_DAYS: u32 = 30;
const DEFAULT_TOP_EVENTS_LIMIT: usize = 10;
const DEFAULT_CONVERSION_WINDOW_SECS: i64 = 86_400;
const DEFAULT_RETENTION_PERIODS: [u32; 4] = [1, 7, 14, 30];

pub async fn save_metric(
    State(state): State<ApiState>,
    Json(req): Json<SaveMetricRequest>,
) -> Result<(StatusCode, Json<Metric>), ApiError> {
    let metric = state
        .metrics
        .save_metric(
            &req.name,
            req.value,
            req.period,
            MetricWrite {
                target: req.target,
                change: None,
                metadata: req.metadata,
            },
        )
        .map_err(map_err)?;
    Ok((StatusCode::CREATED, Json(metric)))
}

pub async fn metric_series(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<SeriesParams>,
) -> ApiResult<Vec<Metric>> {
    state
        .metrics
        .get_metrics(
            &name,
            params.period.unwrap_or(MetricPeriod::Daily),
            params.days.unwrap_or(DEFAULT_SERIES_DAYS),
        )
        .map(Json)
        .map_err(map_err)
}

pub async fn metric_growth(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<SeriesParams>,
) -> ApiResult<f64> {
    state
        .metrics
        .calculate_growth_rate(&name, params.period.unwrap_or(MetricPeriod::Daily))
        .map(Json)
        .map_err(map_err)
}

pub async fn top_events(
    State(state): State<ApiState>,
    Query(params): Query<TopEventsParams>,
) -> ApiResult<Vec<EventCount>> {
    state
        .metrics
        .get_top_events(
            params.limit.unwrap_or(DEFAULT_TOP_EVENTS_LIMIT),
            params.days.unwrap_or(DEFAULT_SERIES_DAYS),
        )
        .map(Json)
        .map_err(map_err)
}

pub async fn active_users(
    State(state): State<ApiState>,
    Query(params): Query<ActiveUsersParams>,
) -> ApiResult<u64> {
    state
        .metrics
        .calculate_active_users(params.period.unwrap_or(MetricPeriod::Daily))
        .map(Json)
        .map_err(map_err)
}

pub async fn conversion_rate(
    State(state): State<ApiState>,
    Query(params): Query<ConversionRateParams>,
) -> ApiResult<f64> {
    state
        .metrics
        .calculate_conversion_rate(
            &params.from_event,
            &params.to_event,
            params.window_secs.unwrap_or(DEFAULT_CONVERSION_WINDOW_SECS),
        )
        .map(Json)
        .map_err(map_err)
}

pub async fn retention(
    State(state): State<ApiState>,
    Query(params): Query<RetentionParams>,
) -> ApiResult<BTreeMap<u32, f64>> {
    state
        .metrics
        .calculate_retention(
            params.cohort_start,
            params.cohort_end,
            &DEFAULT_RETENTION_PERIODS,
        )
        .map(Json)
        .map_err(map_err)
}

// ─── Experiments ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct AssignResponse {
    pub variant: String,
}

#[derive(Debug, Deserialize)]
pub struct ConvertRequest {
    pub user_id: String,
    pub value: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct WinnerRequest {
    pub variant: String,
}

pub async fn create_experiment(
    State(state): State<ApiState>,
    Json(config): Json<ExperimentConfig>,
) -> Result<(StatusCode, Json<Experiment>), ApiError> {
    let experiment = state
        .experiments
        .create_experiment(config)
        .map_err(map_err)?;
    metrics::counter!("analytics.api.experiments.created").increment(1);
    Ok((StatusCode::CREATED, Json(experiment)))
}

pub async fn list_experiments(State(state): State<ApiState>) -> ApiResult<Vec<Experiment>> {
    state.experiments.list_experiments().map(Json).map_err(map_err)
}

pub async fn get_experiment(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Experiment> {
    state.experiments.get_experiment(id).map(Json).map_err(map_err)
}

pub async fn start_experiment(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Experiment> {
    state.experiments.start(id).map(Json).map_err(map_err)
}

pub async fn pause_experiment(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Experiment> {
    state.experiments.pause(id).map(Json).map_err(map_err)
}

pub async fn assign_variant(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AssignRequest>,
) -> ApiResult<AssignResponse> {
    state
        .experiments
        .assign_variant(id, &req.user_id)
        .map(|variant| Json(AssignResponse { variant }))
        .map_err(map_err)
}

pub async fn track_conversion(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ConvertRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .experiments
        .track_conversion(id, &req.user_id, req.value)
        .map_err(map_err)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn experiment_results(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ExperimentResults> {
    state.experiments.get_results(id).map(Json).map_err(map_err)
}

pub async fn declare_winner(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<WinnerRequest>,
) -> ApiResult<Experiment> {
    state
        .experiments
        .declare_winner(id, &req.variant)
        .map(Json)
        .map_err(map_err)
}

pub async fn complete_experiment(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Experiment> {
    state.experiments.complete(id).map(Json).map_err(map_err)
}

// ─── Funnels ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TrackStepRequest {
    pub user_id: String,
    pub session_id: String,
    pub step: usize,
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl RangeParams {
    fn range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.start.zip(self.end)
    }
}

pub async fn create_funnel(
    State(state): State<ApiState>,
    Json(config): Json<FunnelConfig>,
) -> Result<(StatusCode, Json<Funnel>), ApiError> {
    let funnel = state.funnels.create_funnel(config).map_err(map_err)?;
    metrics::counter!("analytics.api.funnels.created").increment(1);
    Ok((StatusCode::CREATED, Json(funnel)))
}

pub async fn list_funnels(State(state): State<ApiState>) -> ApiResult<Vec<Funnel>> {
    state.funnels.list_funnels().map(Json).map_err(map_err)
}

pub async fn get_funnel(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Funnel> {
    state.funnels.get_funnel(id).map(Json).map_err(map_err)
}

pub async fn track_funnel_step(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TrackStepRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .funnels
        .track_step(id, &req.user_id, &req.session_id, req.step)
        .map_err(map_err)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn funnel_results(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Vec<StepResult>> {
    state
        .funnels
        .get_funnel_results(id, params.range())
        .map(Json)
        .map_err(map_err)
}

pub async fn funnel_dropoff(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(params): Query<RangeParams>,
) -> ApiResult<DropoffAnalysis> {
    state
        .funnels
        .get_dropoff_analysis(id, params.range())
        .map(Json)
        .map_err(map_err)
}

// ─── Forecasts ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HorizonParams {
    pub days: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AnomalyParams {
    pub threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ActualRequest {
    pub actual: f64,
}

#[derive(Debug, Deserialize)]
pub struct AccuracyParams {
    pub prediction_type: PredictionType,
}

#[derive(Debug, Serialize)]
pub struct PredictionResponse {
    pub value: f64,
}

const DEFAULT_HORIZON_DAYS: u32 = 30;

pub async fn predict_revenue(
    State(state): State<ApiState>,
    Query(params): Query<HorizonParams>,
) -> ApiResult<PredictionResponse> {
    state
        .forecaster
        .predict_revenue(params.days.unwrap_or(DEFAULT_HORIZON_DAYS))
        .map(|value| Json(PredictionResponse { value }))
        .map_err(map_err)
}

pub async fn predict_user_growth(
    State(state): State<ApiState>,
    Query(params): Query<HorizonParams>,
) -> ApiResult<PredictionResponse> {
    state
        .forecaster
        .predict_user_growth(params.days.unwrap_or(DEFAULT_HORIZON_DAYS))
        .map(|value| Json(PredictionResponse { value }))
        .map_err(map_err)
}

pub async fn forecast_metric(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<HorizonParams>,
) -> ApiResult<Vec<ForecastPoint>> {
    state
        .forecaster
        .forecast_metrics(&name, params.days.unwrap_or(DEFAULT_HORIZON_DAYS))
        .map(Json)
        .map_err(map_err)
}

pub async fn predict_demand(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<HorizonParams>,
) -> ApiResult<PredictionResponse> {
    state
        .forecaster
        .predict_demand(&name, params.days.unwrap_or(DEFAULT_HORIZON_DAYS))
        .map(|value| Json(PredictionResponse { value }))
        .map_err(map_err)
}

pub async fn detect_anomalies(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<AnomalyParams>,
) -> ApiResult<Vec<AnomalyPoint>> {
    state
        .forecaster
        .detect_anomalies(&name, params.threshold)
        .map(Json)
        .map_err(map_err)
}

pub async fn record_actual(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ActualRequest>,
) -> ApiResult<Prediction> {
    state
        .forecaster
        .record_actual(id, req.actual)
        .map(Json)
        .map_err(map_err)
}

pub async fn prediction_accuracy(
    State(state): State<ApiState>,
    Query(params): Query<AccuracyParams>,
) -> ApiResult<f64> {
    state
        .forecaster
        .calculate_prediction_accuracy(params.prediction_type)
        .map(Json)
        .map_err(map_err)
}
