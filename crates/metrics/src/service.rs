//! Metric store service — periodized time series plus the derived
//! aggregates that are computed on read, not stored (active users,
//! conversion rate, cohort retention).

use chrono::{DateTime, Duration, Utc};
use pulse_core::types::{AnalyticsEvent, Metric, MetricPeriod, SIGNUP_EVENT};
use pulse_core::AnalyticsResult;
use pulse_store::{EventQuery, EventRepository, MetricRepository};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Window for read-side aggregates that scan raw events.
const DERIVED_AGGREGATE_LOOKBACK_DAYS: i64 = 30;
/// Window scanned when computing the latest growth step of a series.
const GROWTH_LOOKBACK_DAYS: i64 = 365;

/// Optional fields accompanying a metric write.
#[derive(Debug, Clone, Default)]
pub struct MetricWrite {
    pub target: Option<f64>,
    pub change: Option<f64>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One row of the top-events report.
#[derive(Debug, Clone, Serialize)]
pub struct EventCount {
    pub event: String,
    pub count: u64,
}

/// Read/write service over the metric table, with event-store-backed
/// derived aggregates.
pub struct MetricService {
    metrics: Arc<dyn MetricRepository>,
    events: Arc<dyn EventRepository>,
}

impl MetricService {
    pub fn new(metrics: Arc<dyn MetricRepository>, events: Arc<dyn EventRepository>) -> Self {
        Self { metrics, events }
    }

    /// Upsert one metric value into the bucket containing "now". The
    /// bucket date is truncated here, never caller-supplied, so each
    /// write cycle produces at most one row per `(name, period, date)`.
    pub fn save_metric(
        &self,
        name: &str,
        value: f64,
        period: MetricPeriod,
        write: MetricWrite,
    ) -> AnalyticsResult<Metric> {
        let metric = Metric {
            name: name.to_string(),
            period,
            date: period.bucket_start(Utc::now()),
            value,
            target: write.target,
            change: write.change,
            metadata: write.metadata,
        };
        let metric = self.metrics.upsert(metric)?;
        debug!(name, period = period.as_str(), value, "Metric upserted");
        Ok(metric)
    }

    /// Ascending series over the trailing `lookback_days`.
    pub fn get_metrics(
        &self,
        name: &str,
        period: MetricPeriod,
        lookback_days: u32,
    ) -> AnalyticsResult<Vec<Metric>> {
        let since = Utc::now() - Duration::days(i64::from(lookback_days));
        self.metrics.series(name, period, since)
    }

    /// Percent change between the two most recent points; 0 when fewer
    /// than two points exist or the previous point is 0.
    pub fn calculate_growth_rate(&self, name: &str, period: MetricPeriod) -> AnalyticsResult<f64> {
        let since = Utc::now() - Duration::days(GROWTH_LOOKBACK_DAYS);
        let series = self.metrics.series(name, period, since)?;
        let [.., prev, last] = series.as_slice() else {
            return Ok(0.0);
        };
        if prev.value == 0.0 {
            return Ok(0.0);
        }
        Ok((last.value - prev.value) / prev.value * 100.0)
    }

    /// Event name/count pairs over the trailing window, highest first.
    pub fn get_top_events(&self, limit: usize, days: u32) -> AnalyticsResult<Vec<EventCount>> {
        let since = Utc::now() - Duration::days(i64::from(days));
        let events = self
            .events
            .query(&EventQuery::default().since(since).unbounded())?;

        let mut counts: HashMap<String, u64> = HashMap::new();
        for event in &events {
            *counts.entry(event.event.clone()).or_insert(0) += 1;
        }
        let mut top: Vec<EventCount> = counts
            .into_iter()
            .map(|(event, count)| EventCount { event, count })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then(a.event.cmp(&b.event)));
        top.truncate(limit);
        Ok(top)
    }

    /// Distinct identified users active within the period's trailing
    /// window (1h/24h/7d/30d).
    pub fn calculate_active_users(&self, period: MetricPeriod) -> AnalyticsResult<u64> {
        let since = Utc::now() - period.active_user_window();
        let events = self
            .events
            .query(&EventQuery::default().since(since).unbounded())?;
        let users: HashSet<&String> = events.iter().filter_map(|e| e.user_id.as_ref()).collect();
        Ok(users.len() as u64)
    }

    /// Percent of users who fired `to_event` within `window_secs` of
    /// their first `from_event` in the trailing 30 days. 0 when no user
    /// fired `from_event`.
    pub fn calculate_conversion_rate(
        &self,
        from_event: &str,
        to_event: &str,
        window_secs: i64,
    ) -> AnalyticsResult<f64> {
        let since = Utc::now() - Duration::days(DERIVED_AGGREGATE_LOOKBACK_DAYS);
        let triggers = self
            .events
            .query(&EventQuery::for_event(from_event).since(since).unbounded())?;

        let mut first_trigger: HashMap<&String, DateTime<Utc>> = HashMap::new();
        for event in &triggers {
            if let Some(user) = event.user_id.as_ref() {
                first_trigger
                    .entry(user)
                    .and_modify(|t| *t = (*t).min(event.timestamp))
                    .or_insert(event.timestamp);
            }
        }
        if first_trigger.is_empty() {
            return Ok(0.0);
        }

        let targets = self
            .events
            .query(&EventQuery::for_event(to_event).since(since).unbounded())?;
        let window = Duration::seconds(window_secs);
        let converted = first_trigger
            .iter()
            .filter(|(user, from_ts)| {
                targets.iter().any(|e| {
                    e.user_id.as_ref() == Some(**user)
                        && e.timestamp > **from_ts
                        && e.timestamp <= **from_ts + window
                })
            })
            .count();

        Ok(converted as f64 / first_trigger.len() as f64 * 100.0)
    }

    /// Cohort retention: for users who signed up within the cohort
    /// window, the percentage with any event exactly `period` days after
    /// signup, per requested period, rounded to two decimals.
    pub fn calculate_retention(
        &self,
        cohort_start: DateTime<Utc>,
        cohort_end: DateTime<Utc>,
        periods: &[u32],
    ) -> AnalyticsResult<BTreeMap<u32, f64>> {
        let signups = self.events.query(
            &EventQuery::for_event(SIGNUP_EVENT)
                .since(cohort_start)
                .until(cohort_end)
                .unbounded(),
        )?;

        let mut created_at: HashMap<String, DateTime<Utc>> = HashMap::new();
        for event in &signups {
            if let Some(user) = event.user_id.clone() {
                created_at
                    .entry(user)
                    .and_modify(|t| *t = (*t).min(event.timestamp))
                    .or_insert(event.timestamp);
            }
        }

        let mut retention = BTreeMap::new();
        if created_at.is_empty() {
            for period in periods {
                retention.insert(*period, 0.0);
            }
            return Ok(retention);
        }

        let activity = self
            .events
            .query(&EventQuery::default().since(cohort_start).unbounded())?;
        let mut active_days: HashMap<&String, HashSet<chrono::NaiveDate>> = HashMap::new();
        for event in &activity {
            if let Some(user) = event.user_id.as_ref() {
                if created_at.contains_key(user) {
                    active_days.entry(user).or_default().insert(event.timestamp.date_naive());
                }
            }
        }

        for period in periods {
            let active = created_at
                .iter()
                .filter(|(user, created)| {
                    let target_day = (**created + Duration::days(i64::from(*period))).date_naive();
                    active_days
                        .get(*user)
                        .is_some_and(|days| days.contains(&target_day))
                })
                .count();
            let pct = active as f64 / created_at.len() as f64 * 100.0;
            retention.insert(*period, (pct * 100.0).round() / 100.0);
        }
        Ok(retention)
    }
}
