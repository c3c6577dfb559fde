//! Periodic metric aggregation — rolls raw events into metric buckets.
//!
//! Invoked by the scheduler collaborator on a fixed cadence. Runs are
//! idempotent: each tick recounts the current bucket and upserts, so a
//! concurrent or retried run converges on one row per bucket through the
//! storage layer's atomic upsert, never application-level locking.

use crate::service::{MetricService, MetricWrite};
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use pulse_core::types::{Metric, MetricPeriod};
use pulse_core::AnalyticsResult;
use pulse_store::{EventQuery, EventRepository};
use std::sync::Arc;
use tracing::info;

/// Metric name for the built-in distinct-user roll-up.
pub const ACTIVE_USERS_METRIC: &str = "active_users";

/// One event-count roll-up registration.
#[derive(Debug, Clone)]
pub struct AggregationRule {
    pub metric: String,
    pub event: String,
    pub period: MetricPeriod,
}

/// Lifecycle-scoped aggregator; tests construct isolated instances.
pub struct MetricAggregator {
    service: Arc<MetricService>,
    events: Arc<dyn EventRepository>,
    rules: RwLock<Vec<AggregationRule>>,
}

impl MetricAggregator {
    pub fn new(service: Arc<MetricService>, events: Arc<dyn EventRepository>) -> Self {
        Self {
            service,
            events,
            rules: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, rule: AggregationRule) {
        self.rules.write().push(rule);
    }

    /// One scheduler tick for a period: count each registered event in
    /// the current bucket, compute change vs. the previous bucket, and
    /// upsert. Also refreshes the built-in `active_users` metric.
    pub fn run(&self, period: MetricPeriod) -> AnalyticsResult<Vec<Metric>> {
        let bucket = period.bucket_start(Utc::now());
        let rules: Vec<AggregationRule> = self
            .rules
            .read()
            .iter()
            .filter(|r| r.period == period)
            .cloned()
            .collect();

        let mut written = Vec::with_capacity(rules.len() + 1);
        for rule in &rules {
            let count = self
                .events
                .query(&EventQuery::for_event(&rule.event).since(bucket).unbounded())?
                .len() as f64;
            let change = self.change_vs_previous(&rule.metric, period, count)?;
            written.push(self.service.save_metric(
                &rule.metric,
                count,
                period,
                MetricWrite {
                    change,
                    ..MetricWrite::default()
                },
            )?);
        }

        let active = self.service.calculate_active_users(period)? as f64;
        let change = self.change_vs_previous(ACTIVE_USERS_METRIC, period, active)?;
        written.push(self.service.save_metric(
            ACTIVE_USERS_METRIC,
            active,
            period,
            MetricWrite {
                change,
                ..MetricWrite::default()
            },
        )?);

        info!(
            period = period.as_str(),
            rules = rules.len(),
            metrics = written.len(),
            "Aggregation tick complete"
        );
        metrics::counter!("analytics.aggregation.ticks").increment(1);
        Ok(written)
    }

    /// Percent change against the previous bucket's stored value, when
    /// that bucket exists and is non-zero.
    fn change_vs_previous(
        &self,
        name: &str,
        period: MetricPeriod,
        value: f64,
    ) -> AnalyticsResult<Option<f64>> {
        let bucket = period.bucket_start(Utc::now());
        let prev_bucket = period.bucket_start(bucket - Duration::seconds(1));
        let series = self.service.get_metrics(name, period, 45)?;
        Ok(series
            .iter()
            .find(|m| m.date == prev_bucket)
            .filter(|m| m.value != 0.0)
            .map(|m| (value - m.value) / m.value * 100.0))
    }
}
