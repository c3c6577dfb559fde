//! In-memory repository backends.
//!
//! Production: replace with ClickHouse/PostgreSQL implementations behind
//! the same traits. These keep the same atomicity guarantees the traits
//! promise — DashMap entry operations stand in for the storage layer's
//! unique-constrained insert and upsert-by-key primitives.

use crate::repository::{
    EventQuery, EventRepository, ExperimentRepository, FunnelRepository, MetricRepository,
    PredictionRepository, DEFAULT_QUERY_LIMIT,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use pulse_core::types::{
    AnalyticsEvent, Assignment, Experiment, Funnel, FunnelEvent, Metric, MetricPeriod, Prediction,
    PredictionType,
};
use pulse_core::{AnalyticsError, AnalyticsResult};
use uuid::Uuid;

/// Append-only in-memory event log.
#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<AnalyticsEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventRepository for MemoryEventStore {
    fn append(&self, event: AnalyticsEvent) -> AnalyticsResult<AnalyticsEvent> {
        self.events.write().push(event.clone());
        Ok(event)
    }

    fn query(&self, query: &EventQuery) -> AnalyticsResult<Vec<AnalyticsEvent>> {
        let events = self.events.read();
        let mut matched: Vec<AnalyticsEvent> = events
            .iter()
            .filter(|e| {
                query.user_id.as_ref().is_none_or(|u| e.user_id.as_ref() == Some(u))
                    && query.event.as_ref().is_none_or(|n| &e.event == n)
                    && query.category.as_ref().is_none_or(|c| e.category.as_ref() == Some(c))
                    && query.start.is_none_or(|s| e.timestamp >= s)
                    && query.end.is_none_or(|s| e.timestamp <= s)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched.truncate(query.limit.unwrap_or(DEFAULT_QUERY_LIMIT));
        Ok(matched)
    }
}

type MetricKey = (String, MetricPeriod, DateTime<Utc>);

/// Keyed metric table with last-write-wins upsert.
#[derive(Default)]
pub struct MemoryMetricStore {
    metrics: DashMap<MetricKey, Metric>,
}

impl MemoryMetricStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricRepository for MemoryMetricStore {
    fn upsert(&self, metric: Metric) -> AnalyticsResult<Metric> {
        let key = (metric.name.clone(), metric.period, metric.date);
        self.metrics.insert(key, metric.clone());
        Ok(metric)
    }

    fn series(
        &self,
        name: &str,
        period: MetricPeriod,
        since: DateTime<Utc>,
    ) -> AnalyticsResult<Vec<Metric>> {
        let mut points: Vec<Metric> = self
            .metrics
            .iter()
            .filter(|entry| {
                let (n, p, date) = entry.key();
                n == name && *p == period && *date >= since
            })
            .map(|entry| entry.value().clone())
            .collect();
        points.sort_by_key(|m| m.date);
        Ok(points)
    }
}

/// Experiments and assignments; assignment insert is entry-atomic.
#[derive(Default)]
pub struct MemoryExperimentStore {
    experiments: DashMap<Uuid, Experiment>,
    assignments: DashMap<(Uuid, String), Assignment>,
}

impl MemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExperimentRepository for MemoryExperimentStore {
    fn insert(&self, experiment: Experiment) -> AnalyticsResult<()> {
        self.experiments.insert(experiment.id, experiment);
        Ok(())
    }

    fn get(&self, id: Uuid) -> AnalyticsResult<Option<Experiment>> {
        Ok(self.experiments.get(&id).map(|e| e.value().clone()))
    }

    fn update(&self, experiment: Experiment) -> AnalyticsResult<()> {
        if !self.experiments.contains_key(&experiment.id) {
            return Err(AnalyticsError::NotFound(format!(
                "experiment {}",
                experiment.id
            )));
        }
        self.experiments.insert(experiment.id, experiment);
        Ok(())
    }

    fn list(&self) -> AnalyticsResult<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> =
            self.experiments.iter().map(|e| e.value().clone()).collect();
        experiments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(experiments)
    }

    fn insert_assignment_if_absent(&self, assignment: Assignment) -> AnalyticsResult<Assignment> {
        let key = (assignment.test_id, assignment.user_id.clone());
        // entry() holds the shard lock across the check-and-insert, so a
        // losing concurrent writer reads back the winner's row.
        let stored = self.assignments.entry(key).or_insert(assignment);
        Ok(stored.clone())
    }

    fn assignment(&self, test_id: Uuid, user_id: &str) -> AnalyticsResult<Option<Assignment>> {
        Ok(self
            .assignments
            .get(&(test_id, user_id.to_string()))
            .map(|a| a.value().clone()))
    }

    fn assignments_for(&self, test_id: Uuid) -> AnalyticsResult<Vec<Assignment>> {
        Ok(self
            .assignments
            .iter()
            .filter(|a| a.key().0 == test_id)
            .map(|a| a.value().clone())
            .collect())
    }

    fn update_assignment(&self, assignment: Assignment) -> AnalyticsResult<()> {
        let key = (assignment.test_id, assignment.user_id.clone());
        if !self.assignments.contains_key(&key) {
            return Err(AnalyticsError::NotFound(format!(
                "assignment {}/{}",
                assignment.test_id, assignment.user_id
            )));
        }
        self.assignments.insert(key, assignment);
        Ok(())
    }
}

/// Funnel definitions plus an append-only step log.
#[derive(Default)]
pub struct MemoryFunnelStore {
    funnels: DashMap<Uuid, Funnel>,
    steps: RwLock<Vec<FunnelEvent>>,
}

impl MemoryFunnelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FunnelRepository for MemoryFunnelStore {
    fn insert(&self, funnel: Funnel) -> AnalyticsResult<()> {
        self.funnels.insert(funnel.id, funnel);
        Ok(())
    }

    fn get(&self, id: Uuid) -> AnalyticsResult<Option<Funnel>> {
        Ok(self.funnels.get(&id).map(|f| f.value().clone()))
    }

    fn list(&self) -> AnalyticsResult<Vec<Funnel>> {
        let mut funnels: Vec<Funnel> = self.funnels.iter().map(|f| f.value().clone()).collect();
        funnels.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(funnels)
    }

    fn record_step(&self, event: FunnelEvent) -> AnalyticsResult<()> {
        self.steps.write().push(event);
        Ok(())
    }

    fn steps(
        &self,
        funnel_id: Uuid,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> AnalyticsResult<Vec<FunnelEvent>> {
        Ok(self
            .steps
            .read()
            .iter()
            .filter(|e| {
                e.funnel_id == funnel_id
                    && range.is_none_or(|(start, end)| e.timestamp >= start && e.timestamp <= end)
            })
            .cloned()
            .collect())
    }

    fn user_session_step_count(
        &self,
        funnel_id: Uuid,
        user_id: &str,
        session_id: &str,
    ) -> AnalyticsResult<usize> {
        Ok(self
            .steps
            .read()
            .iter()
            .filter(|e| {
                e.funnel_id == funnel_id && e.user_id == user_id && e.session_id == session_id
            })
            .count())
    }
}

/// Prediction rows keyed by id.
#[derive(Default)]
pub struct MemoryPredictionStore {
    predictions: DashMap<Uuid, Prediction>,
}

impl MemoryPredictionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PredictionRepository for MemoryPredictionStore {
    fn insert(&self, prediction: Prediction) -> AnalyticsResult<()> {
        self.predictions.insert(prediction.id, prediction);
        Ok(())
    }

    fn get(&self, id: Uuid) -> AnalyticsResult<Option<Prediction>> {
        Ok(self.predictions.get(&id).map(|p| p.value().clone()))
    }

    fn list(&self, prediction_type: PredictionType) -> AnalyticsResult<Vec<Prediction>> {
        let mut predictions: Vec<Prediction> = self
            .predictions
            .iter()
            .filter(|p| p.prediction_type == prediction_type)
            .map(|p| p.value().clone())
            .collect();
        predictions.sort_by_key(|p| p.predicted_at);
        Ok(predictions)
    }

    fn update(&self, prediction: Prediction) -> AnalyticsResult<()> {
        if !self.predictions.contains_key(&prediction.id) {
            return Err(AnalyticsError::NotFound(format!(
                "prediction {}",
                prediction.id
            )));
        }
        self.predictions.insert(prediction.id, prediction);
        Ok(())
    }
}
