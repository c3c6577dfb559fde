//! Shared data model for the analytics and experimentation engine.
//!
//! Everything here is a persisted record: behavioral events, periodized
//! metrics, experiments and their assignments, funnels and their step
//! traversals, and baseline forecasts. All types are serde round-trippable
//! so any structured store can hold them.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ─── Well-known event names ─────────────────────────────────────────────

/// Emitted when a user is entered into an experiment.
pub const AB_TEST_ASSIGNED: &str = "ab_test_assigned";
/// Emitted when an experiment assignment converts.
pub const AB_TEST_CONVERTED: &str = "ab_test_converted";
/// Emitted for every recorded funnel step traversal.
pub const FUNNEL_STEP: &str = "funnel_step";
/// Diagnostic event for out-of-order funnel progress.
pub const FUNNEL_STEP_SKIPPED: &str = "funnel_step_skipped";
/// Product event marking account creation; anchors cohort retention.
pub const SIGNUP_EVENT: &str = "user_signed_up";
/// Product event marking a completed order; anchors revenue forecasts.
pub const ORDER_COMPLETED_EVENT: &str = "order_completed";
/// Numeric property on [`ORDER_COMPLETED_EVENT`] carrying the order total.
pub const ORDER_AMOUNT_PROPERTY: &str = "amount";

// ─── Events ─────────────────────────────────────────────────────────────

/// A single behavioral event. Append-only: never updated or deleted.
/// A missing `user_id` denotes an anonymous actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub event: String,
    pub category: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    pub page: Option<String>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AnalyticsEvent {
    /// Create an event with the given name, stamped now.
    pub fn named(event: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: None,
            session_id: None,
            event: event.into(),
            category: None,
            properties: HashMap::new(),
            page: None,
            referrer: None,
            user_agent: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ─── Metrics ────────────────────────────────────────────────────────────

/// Aggregation granularity for a metric time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricPeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl MetricPeriod {
    /// Truncate a timestamp to the start of the bucket containing it.
    /// Weekly buckets start on Monday; monthly on the first of the month.
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let date = at.date_naive();
        let (date, hour) = match self {
            MetricPeriod::Hourly => (date, at.hour()),
            MetricPeriod::Daily => (date, 0),
            MetricPeriod::Weekly => (
                date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
                0,
            ),
            MetricPeriod::Monthly => (date.with_day(1).unwrap_or(date), 0),
        };
        match date.and_hms_opt(hour, 0, 0) {
            Some(naive) => Utc.from_utc_datetime(&naive),
            None => at,
        }
    }

    /// Trailing window used when counting active users for this period.
    pub fn active_user_window(&self) -> Duration {
        match self {
            MetricPeriod::Hourly => Duration::hours(1),
            MetricPeriod::Daily => Duration::hours(24),
            MetricPeriod::Weekly => Duration::days(7),
            MetricPeriod::Monthly => Duration::days(30),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricPeriod::Hourly => "hourly",
            MetricPeriod::Daily => "daily",
            MetricPeriod::Weekly => "weekly",
            MetricPeriod::Monthly => "monthly",
        }
    }
}

/// One point of a named, periodized time series. Unique per
/// `(name, period, date)`; the latest write for a bucket wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub period: MetricPeriod,
    pub date: DateTime<Utc>,
    pub value: f64,
    pub target: Option<f64>,
    /// Percent change vs. the previous bucket, when the writer computed it.
    pub change: Option<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

// ─── Experiments ────────────────────────────────────────────────────────

/// Role of a variant within an experiment. Exactly one variant per
/// experiment carries [`VariantRole::Control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantRole {
    Control,
    Treatment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub name: String,
    pub role: VariantRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
}

/// An A/B test definition. Lifecycle: draft → running ⇄ paused →
/// completed; completed is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub hypothesis: Option<String>,
    pub variants: Vec<Variant>,
    /// Percent of included traffic per variant id; sums to 100.
    pub allocation: HashMap<String, f64>,
    pub metrics: Vec<String>,
    pub primary_metric: String,
    /// Fraction of eligible users actually entered into the test.
    pub traffic_allocation: f64,
    pub status: ExperimentStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub results: Option<ExperimentResults>,
    pub winner: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Experiment {
    pub fn control(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.role == VariantRole::Control)
    }
}

/// Per-variant outcome counters at results-computation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantResults {
    pub participants: u64,
    pub conversions: u64,
    /// Percent. 0 when there are no participants.
    pub conversion_rate: f64,
    /// Mean conversion value. 0 when there are no conversions.
    pub avg_value: f64,
}

/// Computed experiment results. `confidence`/`significant` are only
/// present for two-variant experiments, where a two-proportion z-test
/// applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub variants: HashMap<String, VariantResults>,
    pub z_score: Option<f64>,
    pub confidence: Option<f64>,
    pub significant: Option<bool>,
    pub computed_at: DateTime<Utc>,
}

/// A user's sticky variant assignment. Unique per `(test_id, user_id)`;
/// immutable except the conversion fields, which flip once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub test_id: Uuid,
    pub user_id: String,
    pub variant: String,
    pub converted: bool,
    pub converted_at: Option<DateTime<Utc>>,
    pub value: Option<f64>,
    pub assigned_at: DateTime<Utc>,
}

// ─── Funnels ────────────────────────────────────────────────────────────

/// One step of a funnel, matched against an event name. Steps are
/// zero-indexed and contiguous by `order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelStep {
    pub name: String,
    pub event: String,
    pub order: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Funnel {
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<FunnelStep>,
    pub time_window_minutes: u32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// One (user, session, step) touch. `completed` is true only on the
/// funnel's last step index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelEvent {
    pub funnel_id: Uuid,
    pub user_id: String,
    pub session_id: String,
    pub step: usize,
    pub completed: bool,
    pub timestamp: DateTime<Utc>,
}

// ─── Predictions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionType {
    Revenue,
    Churn,
    Ltv,
    Demand,
    Growth,
}

/// One forecast run. `actual_value`/`accuracy` are back-filled by a
/// later reconciliation step, never at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Uuid,
    pub prediction_type: PredictionType,
    pub target: Option<String>,
    pub value: f64,
    /// Fixed baseline constant, not a computed interval.
    pub confidence: f64,
    pub horizon_days: u32,
    #[serde(default)]
    pub features: HashMap<String, serde_json::Value>,
    pub model_version: String,
    pub predicted_at: DateTime<Utc>,
    pub actual_value: Option<f64>,
    pub accuracy: Option<f64>,
    pub actualized_at: Option<DateTime<Utc>>,
}
