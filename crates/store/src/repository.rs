//! Repository traits for the five persisted collections.
//!
//! Each component receives its repository as an injected `Arc<dyn ...>`,
//! so tests substitute the in-memory backends from [`crate::memory`] and a
//! production deployment can bind a durable store behind the same traits.
//! The storage collaborator is expected to provide durable append,
//! upsert-by-key, and unique-constrained insert primitives.

use chrono::{DateTime, Utc};
use pulse_core::types::{
    AnalyticsEvent, Assignment, Experiment, Funnel, FunnelEvent, Metric, MetricPeriod, Prediction,
    PredictionType,
};
use pulse_core::AnalyticsResult;
use uuid::Uuid;

/// Bound applied to event queries when the caller does not pass one.
pub const DEFAULT_QUERY_LIMIT: usize = 1000;

/// Filters for reading back events, newest first.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub user_id: Option<String>,
    pub event: Option<String>,
    pub category: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn for_event(event: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            ..Self::default()
        }
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Remove the result bound for internal full-window scans.
    pub fn unbounded(mut self) -> Self {
        self.limit = Some(usize::MAX);
        self
    }
}

/// Durable append-only log of behavioral events.
pub trait EventRepository: Send + Sync {
    /// Append one event. Rows are immutable once written.
    fn append(&self, event: AnalyticsEvent) -> AnalyticsResult<AnalyticsEvent>;

    /// Read events matching the filters, newest first, bounded by the
    /// query limit (default [`DEFAULT_QUERY_LIMIT`]).
    fn query(&self, query: &EventQuery) -> AnalyticsResult<Vec<AnalyticsEvent>>;
}

/// Named, periodized numeric time series.
pub trait MetricRepository: Send + Sync {
    /// Atomic upsert keyed by `(name, period, date)`; last write wins.
    fn upsert(&self, metric: Metric) -> AnalyticsResult<Metric>;

    /// Ascending series for one metric name and period from `since`.
    fn series(
        &self,
        name: &str,
        period: MetricPeriod,
        since: DateTime<Utc>,
    ) -> AnalyticsResult<Vec<Metric>>;
}

/// Experiments plus their unique-per-`(test_id, user_id)` assignments.
pub trait ExperimentRepository: Send + Sync {
    fn insert(&self, experiment: Experiment) -> AnalyticsResult<()>;
    fn get(&self, id: Uuid) -> AnalyticsResult<Option<Experiment>>;
    fn update(&self, experiment: Experiment) -> AnalyticsResult<()>;
    fn list(&self) -> AnalyticsResult<Vec<Experiment>>;

    /// Single atomic insert-if-absent on `(test_id, user_id)`. A losing
    /// concurrent writer reads back the winner's row; callers must treat
    /// the returned assignment as authoritative.
    fn insert_assignment_if_absent(&self, assignment: Assignment) -> AnalyticsResult<Assignment>;

    fn assignment(&self, test_id: Uuid, user_id: &str) -> AnalyticsResult<Option<Assignment>>;
    fn assignments_for(&self, test_id: Uuid) -> AnalyticsResult<Vec<Assignment>>;

    /// Persist conversion fields. The variant itself never changes.
    fn update_assignment(&self, assignment: Assignment) -> AnalyticsResult<()>;
}

/// Funnels plus their per-step traversal log.
pub trait FunnelRepository: Send + Sync {
    fn insert(&self, funnel: Funnel) -> AnalyticsResult<()>;
    fn get(&self, id: Uuid) -> AnalyticsResult<Option<Funnel>>;
    fn list(&self) -> AnalyticsResult<Vec<Funnel>>;

    fn record_step(&self, event: FunnelEvent) -> AnalyticsResult<()>;

    /// All step events for a funnel, optionally bounded to a time range,
    /// in recording order.
    fn steps(
        &self,
        funnel_id: Uuid,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> AnalyticsResult<Vec<FunnelEvent>>;

    /// Count of prior step touches for one `(user, session)` pair.
    fn user_session_step_count(
        &self,
        funnel_id: Uuid,
        user_id: &str,
        session_id: &str,
    ) -> AnalyticsResult<usize>;
}

/// Forecast rows; created once per run, actualized at most once later.
pub trait PredictionRepository: Send + Sync {
    fn insert(&self, prediction: Prediction) -> AnalyticsResult<()>;
    fn get(&self, id: Uuid) -> AnalyticsResult<Option<Prediction>>;
    fn list(&self, prediction_type: PredictionType) -> AnalyticsResult<Vec<Prediction>>;
    fn update(&self, prediction: Prediction) -> AnalyticsResult<()>;
}
