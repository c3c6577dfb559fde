//! Funnel tracking — ordered step traversal with per-step conversion
//! and drop-off analysis.

use chrono::{DateTime, Utc};
use pulse_core::types::{
    AnalyticsEvent, Funnel, FunnelEvent, FunnelStep, FUNNEL_STEP, FUNNEL_STEP_SKIPPED,
};
use pulse_core::{AnalyticsError, AnalyticsResult};
use pulse_store::{EventRepository, FunnelRepository};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Configuration for a new funnel.
#[derive(Debug, Clone, Deserialize)]
pub struct FunnelConfig {
    pub name: String,
    pub steps: Vec<FunnelStep>,
    pub time_window_minutes: u32,
}

/// Per-step results, in step order.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: usize,
    pub name: String,
    /// Distinct users touching this step.
    pub users: u64,
    /// Distinct users who also reached the next step (for the last
    /// step: users that completed the funnel).
    pub conversions: u64,
    pub conversion_rate: f64,
    /// Users lost versus the previous step; 0 for the first step.
    pub dropoff: u64,
    pub dropoff_rate: f64,
    /// Mean seconds from this step to the next over matched
    /// (user, session) pairs; absent when no pairs matched.
    pub avg_time_to_next_secs: Option<f64>,
}

/// Where a funnel loses the most users.
#[derive(Debug, Clone, Serialize)]
pub struct DropoffAnalysis {
    pub worst_step: Option<WorstStep>,
    pub total_dropoff: u64,
    pub avg_dropoff_rate: f64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorstStep {
    pub step: usize,
    pub name: String,
    pub dropoff_rate: f64,
}

pub struct FunnelTracker {
    repo: Arc<dyn FunnelRepository>,
    events: Arc<dyn EventRepository>,
}

impl FunnelTracker {
    pub fn new(repo: Arc<dyn FunnelRepository>, events: Arc<dyn EventRepository>) -> Self {
        Self { repo, events }
    }

    /// Validate and persist a funnel. Steps must be contiguous and
    /// zero-indexed by `order`.
    pub fn create_funnel(&self, config: FunnelConfig) -> AnalyticsResult<Funnel> {
        if config.steps.is_empty() {
            return Err(AnalyticsError::Validation(
                "funnel requires at least one step".into(),
            ));
        }
        let mut steps = config.steps;
        steps.sort_by_key(|s| s.order);
        for (index, step) in steps.iter().enumerate() {
            if step.order != index {
                return Err(AnalyticsError::Validation(format!(
                    "funnel steps must be contiguous and zero-indexed; expected order {index}, got {}",
                    step.order
                )));
            }
        }

        let funnel = Funnel {
            id: Uuid::new_v4(),
            name: config.name,
            steps,
            time_window_minutes: config.time_window_minutes,
            active: true,
            created_at: Utc::now(),
        };
        self.repo.insert(funnel.clone())?;
        info!(funnel_id = %funnel.id, name = %funnel.name, steps = funnel.steps.len(), "Funnel created");
        Ok(funnel)
    }

    pub fn get_funnel(&self, funnel_id: Uuid) -> AnalyticsResult<Funnel> {
        self.repo
            .get(funnel_id)?
            .ok_or_else(|| AnalyticsError::NotFound(format!("funnel {funnel_id}")))
    }

    pub fn list_funnels(&self) -> AnalyticsResult<Vec<Funnel>> {
        self.repo.list()
    }

    /// Record one step traversal. Out-of-order progress is tolerated:
    /// when prior touches are missing, a `funnel_step_skipped`
    /// diagnostic event is emitted and the step is recorded anyway.
    pub fn track_step(
        &self,
        funnel_id: Uuid,
        user_id: &str,
        session_id: &str,
        step: usize,
    ) -> AnalyticsResult<()> {
        let funnel = self.get_funnel(funnel_id)?;
        if !funnel.active {
            return Err(AnalyticsError::Validation(format!(
                "funnel {funnel_id} is not active"
            )));
        }
        if step >= funnel.steps.len() {
            return Err(AnalyticsError::Validation(format!(
                "step {step} out of range for funnel with {} steps",
                funnel.steps.len()
            )));
        }

        if step > 0 {
            let prior = self
                .repo
                .user_session_step_count(funnel_id, user_id, session_id)?;
            if prior < step {
                self.events.append(
                    AnalyticsEvent::named(FUNNEL_STEP_SKIPPED)
                        .with_user(user_id)
                        .with_session(session_id)
                        .with_category("funnels")
                        .with_property("funnel_id", serde_json::json!(funnel_id))
                        .with_property("step", serde_json::json!(step))
                        .with_property("skipped_steps", serde_json::json!(step - prior)),
                )?;
                metrics::counter!("funnels.steps.skipped").increment(1);
            }
        }

        let last_index = funnel.steps.len() - 1;
        self.repo.record_step(FunnelEvent {
            funnel_id,
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            step,
            completed: step == last_index,
            timestamp: Utc::now(),
        })?;
        self.events.append(
            AnalyticsEvent::named(FUNNEL_STEP)
                .with_user(user_id)
                .with_session(session_id)
                .with_category("funnels")
                .with_property("funnel_id", serde_json::json!(funnel_id))
                .with_property("step", serde_json::json!(step)),
        )?;
        metrics::counter!("funnels.steps.recorded").increment(1);
        Ok(())
    }

    /// Per-step conversion and drop-off, optionally bounded to a range.
    pub fn get_funnel_results(
        &self,
        funnel_id: Uuid,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> AnalyticsResult<Vec<StepResult>> {
        let funnel = self.get_funnel(funnel_id)?;
        let events = self.repo.steps(funnel_id, range)?;

        // Distinct users per step, and earliest touch per (user, session, step).
        let mut step_users: Vec<HashSet<&str>> = vec![HashSet::new(); funnel.steps.len()];
        let mut completed_users: HashSet<&str> = HashSet::new();
        let mut first_touch: HashMap<(&str, &str, usize), DateTime<Utc>> = HashMap::new();
        for event in &events {
            if event.step >= funnel.steps.len() {
                continue;
            }
            step_users[event.step].insert(&event.user_id);
            if event.completed {
                completed_users.insert(&event.user_id);
            }
            first_touch
                .entry((&event.user_id, &event.session_id, event.step))
                .and_modify(|t| *t = (*t).min(event.timestamp))
                .or_insert(event.timestamp);
        }

        let mut results = Vec::with_capacity(funnel.steps.len());
        for (i, step) in funnel.steps.iter().enumerate() {
            let users = step_users[i].len() as u64;
            let conversions = if i + 1 < funnel.steps.len() {
                step_users[i].intersection(&step_users[i + 1]).count() as u64
            } else {
                step_users[i]
                    .iter()
                    .filter(|u| completed_users.contains(*u))
                    .count() as u64
            };
            let (dropoff, dropoff_rate) = if i > 0 {
                let prev = step_users[i - 1].len() as u64;
                let dropoff = prev.saturating_sub(users);
                (
                    dropoff,
                    if prev > 0 { dropoff as f64 / prev as f64 } else { 0.0 },
                )
            } else {
                (0, 0.0)
            };

            let avg_time_to_next_secs = if i + 1 < funnel.steps.len() {
                Self::mean_step_gap(&first_touch, i)
            } else {
                None
            };

            results.push(StepResult {
                step: i,
                name: step.name.clone(),
                users,
                conversions,
                conversion_rate: if users > 0 {
                    conversions as f64 / users as f64
                } else {
                    0.0
                },
                dropoff,
                dropoff_rate,
                avg_time_to_next_secs,
            });
        }
        Ok(results)
    }

    /// Mean seconds between step `i` and `i + 1` over (user, session)
    /// pairs that touched both, ignoring pairs recorded out of order.
    fn mean_step_gap(
        first_touch: &HashMap<(&str, &str, usize), DateTime<Utc>>,
        step: usize,
    ) -> Option<f64> {
        let mut total = 0.0;
        let mut matched = 0u64;
        for ((user, session, s), at) in first_touch {
            if *s != step {
                continue;
            }
            if let Some(next) = first_touch.get(&(*user, *session, step + 1)) {
                let gap = (*next - *at).num_milliseconds() as f64 / 1000.0;
                if gap >= 0.0 {
                    total += gap;
                    matched += 1;
                }
            }
        }
        (matched > 0).then(|| total / matched as f64)
    }

    /// The single worst step by drop-off rate, the total users lost,
    /// and the mean drop-off rate across steps.
    pub fn get_dropoff_analysis(
        &self,
        funnel_id: Uuid,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> AnalyticsResult<DropoffAnalysis> {
        let results = self.get_funnel_results(funnel_id, range)?;
        let after_first = &results[1..];

        let worst_step = after_first
            .iter()
            .max_by(|a, b| a.dropoff_rate.total_cmp(&b.dropoff_rate))
            .filter(|s| s.dropoff_rate > 0.0)
            .map(|s| WorstStep {
                step: s.step,
                name: s.name.clone(),
                dropoff_rate: s.dropoff_rate,
            });
        let total_dropoff = after_first.iter().map(|s| s.dropoff).sum();
        let avg_dropoff_rate = if after_first.is_empty() {
            0.0
        } else {
            after_first.iter().map(|s| s.dropoff_rate).sum::<f64>() / after_first.len() as f64
        };

        Ok(DropoffAnalysis {
            worst_step,
            total_dropoff,
            avg_dropoff_rate,
            computed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pulse_store::{EventQuery, MemoryEventStore, MemoryFunnelStore};

    fn tracker() -> (FunnelTracker, Arc<MemoryEventStore>) {
        let repo = Arc::new(MemoryFunnelStore::new());
        let events = Arc::new(MemoryEventStore::new());
        (FunnelTracker::new(repo, events.clone()), events)
    }

    fn enrollment_funnel(tracker: &FunnelTracker) -> Funnel {
        tracker
            .create_funnel(FunnelConfig {
                name: "course-enrollment".into(),
                steps: vec![
                    FunnelStep {
                        name: "Visit course page".into(),
                        event: "course_viewed".into(),
                        order: 0,
                    },
                    FunnelStep {
                        name: "Start checkout".into(),
                        event: "checkout_started".into(),
                        order: 1,
                    },
                    FunnelStep {
                        name: "Enroll".into(),
                        event: "course_enrolled".into(),
                        order: 2,
                    },
                ],
                time_window_minutes: 60,
            })
            .unwrap()
    }

    #[test]
    fn test_steps_must_be_contiguous() {
        let (tracker, _) = tracker();
        let result = tracker.create_funnel(FunnelConfig {
            name: "broken".into(),
            steps: vec![
                FunnelStep { name: "a".into(), event: "a".into(), order: 0 },
                FunnelStep { name: "b".into(), event: "b".into(), order: 2 },
            ],
            time_window_minutes: 30,
        });
        assert!(matches!(result, Err(AnalyticsError::Validation(_))));
    }

    #[test]
    fn test_unordered_step_input_is_normalized() {
        let (tracker, _) = tracker();
        let funnel = tracker
            .create_funnel(FunnelConfig {
                name: "reversed".into(),
                steps: vec![
                    FunnelStep { name: "b".into(), event: "b".into(), order: 1 },
                    FunnelStep { name: "a".into(), event: "a".into(), order: 0 },
                ],
                time_window_minutes: 30,
            })
            .unwrap();
        assert_eq!(funnel.steps[0].name, "a");
        assert_eq!(funnel.steps[1].name, "b");
    }

    #[test]
    fn test_completed_only_on_last_step() {
        let (tracker, _) = tracker();
        let funnel = enrollment_funnel(&tracker);
        for step in 0..3 {
            tracker.track_step(funnel.id, "u1", "s1", step).unwrap();
        }
        let results = tracker.get_funnel_results(funnel.id, None).unwrap();
        assert_eq!(results[2].conversions, 1);
    }

    #[test]
    fn test_out_of_range_step_rejected() {
        let (tracker, _) = tracker();
        let funnel = enrollment_funnel(&tracker);
        assert!(matches!(
            tracker.track_step(funnel.id, "u1", "s1", 3),
            Err(AnalyticsError::Validation(_))
        ));
    }

    #[test]
    fn test_skipping_steps_emits_diagnostic_but_records() {
        let (tracker, events) = tracker();
        let funnel = enrollment_funnel(&tracker);
        tracker.track_step(funnel.id, "u1", "s1", 2).unwrap();

        let skipped = events
            .query(&EventQuery::for_event(FUNNEL_STEP_SKIPPED))
            .unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].properties["skipped_steps"], serde_json::json!(2));

        let results = tracker.get_funnel_results(funnel.id, None).unwrap();
        assert_eq!(results[2].users, 1);
    }

    #[test]
    fn test_funnel_results_rates_and_dropoff() {
        let (tracker, _) = tracker();
        let funnel = enrollment_funnel(&tracker);
        // 4 users view, 2 start checkout, 1 enrolls.
        for user in ["u1", "u2", "u3", "u4"] {
            tracker.track_step(funnel.id, user, "s", 0).unwrap();
        }
        for user in ["u1", "u2"] {
            tracker.track_step(funnel.id, user, "s", 1).unwrap();
        }
        tracker.track_step(funnel.id, "u1", "s", 2).unwrap();

        let results = tracker.get_funnel_results(funnel.id, None).unwrap();
        assert_eq!(results[0].users, 4);
        assert_eq!(results[0].conversions, 2);
        assert!((results[0].conversion_rate - 0.5).abs() < 1e-9);
        assert_eq!(results[1].dropoff, 2);
        assert!((results[1].dropoff_rate - 0.5).abs() < 1e-9);
        assert_eq!(results[2].users, 1);
        assert_eq!(results[2].conversions, 1);
        assert!(results[0].avg_time_to_next_secs.is_some());
        assert!(results[2].avg_time_to_next_secs.is_none());

        for step in &results {
            assert!(step.conversion_rate <= 1.0);
            assert!(step.dropoff_rate <= 1.0);
        }
    }

    #[test]
    fn test_rates_bounded_with_skipped_traffic() {
        let (tracker, _) = tracker();
        let funnel = enrollment_funnel(&tracker);
        // More users land on step 1 than ever touched step 0.
        tracker.track_step(funnel.id, "u1", "s", 0).unwrap();
        for user in ["u1", "u2", "u3"] {
            tracker.track_step(funnel.id, user, "s", 1).unwrap();
        }
        let results = tracker.get_funnel_results(funnel.id, None).unwrap();
        for step in &results {
            assert!(step.conversion_rate <= 1.0, "step {}", step.step);
            assert!(step.dropoff_rate <= 1.0, "step {}", step.step);
        }
    }

    #[test]
    fn test_dropoff_analysis_finds_worst_step() {
        let (tracker, _) = tracker();
        let funnel = enrollment_funnel(&tracker);
        for user in ["u1", "u2", "u3", "u4"] {
            tracker.track_step(funnel.id, user, "s", 0).unwrap();
        }
        for user in ["u1", "u2", "u3"] {
            tracker.track_step(funnel.id, user, "s", 1).unwrap();
        }
        tracker.track_step(funnel.id, "u1", "s", 2).unwrap();

        let analysis = tracker.get_dropoff_analysis(funnel.id, None).unwrap();
        let worst = analysis.worst_step.unwrap();
        // Step 1 loses 25%, step 2 loses ~67%.
        assert_eq!(worst.step, 2);
        assert_eq!(analysis.total_dropoff, 3);
        assert!(analysis.avg_dropoff_rate > 0.0);
    }

    #[test]
    fn test_results_for_unknown_funnel() {
        let (tracker, _) = tracker();
        assert!(matches!(
            tracker.get_funnel_results(Uuid::new_v4(), None),
            Err(AnalyticsError::NotFound(_))
        ));
    }
}
