//! z-score anomaly detection over a metric window.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Minimum points before detection produces any signal.
pub const MIN_HISTORY_POINTS: usize = 7;

/// A flagged point: the observed value against the window mean.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyPoint {
    pub date: DateTime<Utc>,
    pub value: f64,
    pub expected: f64,
}

/// Flag points whose distance from the window mean exceeds `threshold`
/// standard deviations. Population statistics over the whole window; a
/// zero standard deviation (flat series) yields no anomalies rather
/// than dividing by zero.
pub fn detect(points: &[(DateTime<Utc>, f64)], threshold: f64) -> Vec<AnomalyPoint> {
    if points.len() < MIN_HISTORY_POINTS {
        return Vec::new();
    }

    let n = points.len() as f64;
    let mean = points.iter().map(|(_, v)| v).sum::<f64>() / n;
    let variance = points.iter().map(|(_, v)| (v - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return Vec::new();
    }

    points
        .iter()
        .filter(|(_, value)| (value - mean).abs() / std_dev > threshold)
        .map(|(date, value)| AnomalyPoint {
            date: *date,
            value: *value,
            expected: mean,
        })
        .collect()
}
