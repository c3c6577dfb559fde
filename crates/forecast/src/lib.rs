//! Baseline forecasting and anomaly detection over stored metrics and
//! events.

#![warn(clippy::unwrap_used)]

pub mod anomaly;
pub mod forecaster;

pub use anomaly::{AnomalyPoint, MIN_HISTORY_POINTS};
pub use forecaster::{
    ForecastPoint, Forecaster, DEFAULT_ANOMALY_THRESHOLD, DEMAND_BASELINE_CONFIDENCE,
    GROWTH_BASELINE_CONFIDENCE, MODEL_VERSION, REVENUE_BASELINE_CONFIDENCE,
};
