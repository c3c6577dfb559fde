//! Baseline statistical forecasting over the metric and event stores.
//!
//! Every prediction here is a transparent, auditable statistic — mean
//! daily value with a growth adjustment, or a linear trend over recent
//! metric points. The confidence constants below are fixed labels for
//! that simplicity, deliberately not computed intervals; swapping in a
//! trained model would change their meaning and must not happen
//! silently.

use crate::anomaly::{self, AnomalyPoint, MIN_HISTORY_POINTS};
use chrono::{DateTime, Duration, Utc};
use pulse_core::config::ForecastConfig;
use pulse_core::types::{
    MetricPeriod, Prediction, PredictionType, ORDER_AMOUNT_PROPERTY, ORDER_COMPLETED_EVENT,
    SIGNUP_EVENT,
};
use pulse_core::{AnalyticsError, AnalyticsResult};
use pulse_store::{EventQuery, EventRepository, MetricRepository, PredictionRepository};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Fixed baseline confidence for revenue projections.
pub const REVENUE_BASELINE_CONFIDENCE: f64 = 0.75;
/// Fixed baseline confidence for user-growth projections.
pub const GROWTH_BASELINE_CONFIDENCE: f64 = 0.70;
/// Fixed baseline confidence for metric-demand projections.
pub const DEMAND_BASELINE_CONFIDENCE: f64 = 0.65;

/// Version tag stamped on every persisted prediction.
pub const MODEL_VERSION: &str = "baseline-v1";

/// Size of the early/recent segments compared for the growth rate.
const GROWTH_SEGMENT_DAYS: usize = 30;
/// Default anomaly threshold in standard deviations.
pub const DEFAULT_ANOMALY_THRESHOLD: f64 = 2.0;

/// One projected metric value.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastPoint {
    pub date: DateTime<Utc>,
    pub value: f64,
}

pub struct Forecaster {
    metrics: Arc<dyn MetricRepository>,
    events: Arc<dyn EventRepository>,
    predictions: Arc<dyn PredictionRepository>,
    /// Days of raw event history feeding the mean-daily baselines.
    lookback_days: usize,
    /// Days of metric history scanned for anomalies.
    anomaly_window_days: usize,
}

enum DailyValue {
    Count,
    SumProperty(&'static str),
}

impl Forecaster {
    pub fn new(
        config: &ForecastConfig,
        metrics: Arc<dyn MetricRepository>,
        events: Arc<dyn EventRepository>,
        predictions: Arc<dyn PredictionRepository>,
    ) -> Self {
        Self {
            metrics,
            events,
            predictions,
            lookback_days: config.lookback_days as usize,
            anomaly_window_days: config.anomaly_window_days as usize,
        }
    }

    /// Project revenue over `days` from completed-order history.
    /// Returns 0 without persisting when no order history exists.
    pub fn predict_revenue(&self, days: u32) -> AnalyticsResult<f64> {
        self.event_baseline(
            ORDER_COMPLETED_EVENT,
            DailyValue::SumProperty(ORDER_AMOUNT_PROPERTY),
            days,
            PredictionType::Revenue,
            REVENUE_BASELINE_CONFIDENCE,
        )
    }

    /// Project signups over `days` from signup history. Returns 0
    /// without persisting when no signup history exists.
    pub fn predict_user_growth(&self, days: u32) -> AnalyticsResult<f64> {
        self.event_baseline(
            SIGNUP_EVENT,
            DailyValue::Count,
            days,
            PredictionType::Growth,
            GROWTH_BASELINE_CONFIDENCE,
        )
    }

    fn event_baseline(
        &self,
        event: &str,
        value: DailyValue,
        days: u32,
        prediction_type: PredictionType,
        confidence: f64,
    ) -> AnalyticsResult<f64> {
        let (series, has_data) = self.daily_event_series(event, &value)?;
        if !has_data {
            return Ok(0.0);
        }

        // The early/recent segments must not overlap; a short lookback
        // degrades to a flat growth rate rather than double-counting.
        let growth_rate = if series.len() >= 2 * GROWTH_SEGMENT_DAYS {
            let early: f64 = series[..GROWTH_SEGMENT_DAYS].iter().sum();
            let recent: f64 = series[series.len() - GROWTH_SEGMENT_DAYS..].iter().sum();
            if early != 0.0 {
                (recent - early) / early
            } else {
                0.0
            }
        } else {
            0.0
        };
        let mean_daily = series.iter().sum::<f64>() / series.len() as f64;
        let predicted = mean_daily * f64::from(days) * (1.0 + growth_rate);

        let prediction = Prediction {
            id: Uuid::new_v4(),
            prediction_type,
            target: Some(event.to_string()),
            value: predicted,
            confidence,
            horizon_days: days,
            features: HashMap::from([
                ("mean_daily".into(), serde_json::json!(mean_daily)),
                ("growth_rate".into(), serde_json::json!(growth_rate)),
                ("lookback_days".into(), serde_json::json!(self.lookback_days)),
            ]),
            model_version: MODEL_VERSION.into(),
            predicted_at: Utc::now(),
            actual_value: None,
            accuracy: None,
            actualized_at: None,
        };
        self.predictions.insert(prediction)?;
        metrics::counter!("forecast.predictions.created").increment(1);
        info!(
            kind = ?prediction_type,
            horizon_days = days,
            value = predicted,
            "Baseline prediction recorded"
        );
        Ok(predicted)
    }

    /// Per-day values over the trailing lookback, index 0 oldest.
    fn daily_event_series(
        &self,
        event: &str,
        value: &DailyValue,
    ) -> AnalyticsResult<(Vec<f64>, bool)> {
        let today = MetricPeriod::Daily.bucket_start(Utc::now());
        let start = today - Duration::days(self.lookback_days as i64 - 1);
        let events = self
            .events
            .query(&EventQuery::for_event(event).since(start).unbounded())?;

        let mut series = vec![0.0; self.lookback_days];
        for e in &events {
            let day = (e.timestamp.date_naive() - start.date_naive()).num_days();
            if let Some(slot) = usize::try_from(day).ok().and_then(|d| series.get_mut(d)) {
                *slot += match value {
                    DailyValue::Count => 1.0,
                    DailyValue::SumProperty(key) => {
                        e.properties.get(*key).and_then(|v| v.as_f64()).unwrap_or(0.0)
                    }
                };
            }
        }
        Ok((series, !events.is_empty()))
    }

    /// Linear trend extrapolation over recent daily metric points.
    /// Needs at least [`MIN_HISTORY_POINTS`] points; otherwise empty.
    /// Forecast values are floored at zero.
    pub fn forecast_metrics(&self, name: &str, days: u32) -> AnalyticsResult<Vec<ForecastPoint>> {
        let since = Utc::now() - Duration::days(self.lookback_days as i64);
        let series = self.metrics.series(name, MetricPeriod::Daily, since)?;
        if series.len() < MIN_HISTORY_POINTS {
            return Ok(Vec::new());
        }

        let mean = |window: &[pulse_core::types::Metric]| {
            window.iter().map(|m| m.value).sum::<f64>() / window.len() as f64
        };
        let recent = mean(&series[series.len() - MIN_HISTORY_POINTS..]);
        let early = mean(&series[..MIN_HISTORY_POINTS]);
        // The window means sit (len - window) points apart, which makes
        // this the per-point slope of the series.
        let span = (series.len() - MIN_HISTORY_POINTS).max(1);
        let slope = (recent - early) / span as f64;

        let last = &series[series.len() - 1];
        let forecast = (1..=days)
            .map(|i| ForecastPoint {
                date: last.date + Duration::days(i64::from(i)),
                value: (last.value + slope * f64::from(i)).max(0.0),
            })
            .collect();
        Ok(forecast)
    }

    /// Persist a demand projection for a metric: the summed forecast
    /// over the horizon. Returns 0 without persisting when the metric
    /// lacks forecastable history.
    pub fn predict_demand(&self, metric_name: &str, days: u32) -> AnalyticsResult<f64> {
        let forecast = self.forecast_metrics(metric_name, days)?;
        if forecast.is_empty() {
            return Ok(0.0);
        }
        let total: f64 = forecast.iter().map(|p| p.value).sum();

        self.predictions.insert(Prediction {
            id: Uuid::new_v4(),
            prediction_type: PredictionType::Demand,
            target: Some(metric_name.to_string()),
            value: total,
            confidence: DEMAND_BASELINE_CONFIDENCE,
            horizon_days: days,
            features: HashMap::from([(
                "forecast_points".into(),
                serde_json::json!(forecast.len()),
            )]),
            model_version: MODEL_VERSION.into(),
            predicted_at: Utc::now(),
            actual_value: None,
            accuracy: None,
            actualized_at: None,
        })?;
        metrics::counter!("forecast.predictions.created").increment(1);
        Ok(total)
    }

    /// z-score anomaly scan over the configured trailing window of a
    /// daily metric.
    pub fn detect_anomalies(
        &self,
        name: &str,
        threshold: Option<f64>,
    ) -> AnalyticsResult<Vec<AnomalyPoint>> {
        let since = Utc::now() - Duration::days(self.anomaly_window_days as i64);
        let series = self.metrics.series(name, MetricPeriod::Daily, since)?;
        let points: Vec<(DateTime<Utc>, f64)> =
            series.iter().map(|m| (m.date, m.value)).collect();
        Ok(anomaly::detect(
            &points,
            threshold.unwrap_or(DEFAULT_ANOMALY_THRESHOLD),
        ))
    }

    /// Reconcile a prediction against its observed outcome. Idempotent:
    /// an already-actualized prediction is returned unchanged.
    pub fn record_actual(&self, prediction_id: Uuid, actual: f64) -> AnalyticsResult<Prediction> {
        let mut prediction = self
            .predictions
            .get(prediction_id)?
            .ok_or_else(|| AnalyticsError::NotFound(format!("prediction {prediction_id}")))?;
        if prediction.actualized_at.is_some() {
            return Ok(prediction);
        }

        prediction.actual_value = Some(actual);
        prediction.accuracy = Some(if actual == 0.0 {
            0.0
        } else {
            (1.0 - (prediction.value - actual).abs() / actual).max(0.0)
        });
        prediction.actualized_at = Some(Utc::now());
        self.predictions.update(prediction.clone())?;
        Ok(prediction)
    }

    /// Mean accuracy over actualized predictions of a type, on a 0–100
    /// scale. 0 when nothing has been actualized.
    pub fn calculate_prediction_accuracy(
        &self,
        prediction_type: PredictionType,
    ) -> AnalyticsResult<f64> {
        let accuracies: Vec<f64> = self
            .predictions
            .list(prediction_type)?
            .iter()
            .filter_map(|p| p.accuracy)
            .collect();
        if accuracies.is_empty() {
            return Ok(0.0);
        }
        Ok(accuracies.iter().sum::<f64>() / accuracies.len() as f64 * 100.0)
    }
}
