//! Experiment lifecycle, assignment bucketing, conversion tracking,
//! and significance computation.
//!
//! Assignment stickiness is enforced by the storage layer's atomic
//! insert-if-absent on `(test_id, user_id)`; two concurrent first
//! assignments for the same user can never observe different variants.

use crate::stats;
use chrono::Utc;
use pulse_core::types::{
    AnalyticsEvent, Assignment, Experiment, ExperimentResults, ExperimentStatus, Variant,
    VariantResults, VariantRole, AB_TEST_ASSIGNED, AB_TEST_CONVERTED,
};
use pulse_core::{AnalyticsError, AnalyticsResult};
use pulse_store::{EventRepository, ExperimentRepository};
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Allowed drift of the allocation sum from 100 percent.
const ALLOCATION_TOLERANCE: f64 = 0.01;

/// Configuration for a new experiment, created in `draft`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub description: Option<String>,
    pub hypothesis: Option<String>,
    pub variants: Vec<Variant>,
    /// Percent of included traffic per variant id.
    pub allocation: HashMap<String, f64>,
    #[serde(default)]
    pub metrics: Vec<String>,
    pub primary_metric: String,
    #[serde(default = "default_traffic_allocation")]
    pub traffic_allocation: f64,
}

fn default_traffic_allocation() -> f64 {
    1.0
}

pub struct ExperimentManager {
    repo: Arc<dyn ExperimentRepository>,
    events: Arc<dyn EventRepository>,
}

impl ExperimentManager {
    pub fn new(repo: Arc<dyn ExperimentRepository>, events: Arc<dyn EventRepository>) -> Self {
        Self { repo, events }
    }

    /// Validate and persist a new draft experiment.
    pub fn create_experiment(&self, config: ExperimentConfig) -> AnalyticsResult<Experiment> {
        if config.variants.is_empty() {
            return Err(AnalyticsError::Validation(
                "experiment requires at least one variant".into(),
            ));
        }
        let controls = config
            .variants
            .iter()
            .filter(|v| v.role == VariantRole::Control)
            .count();
        if controls != 1 {
            return Err(AnalyticsError::Validation(format!(
                "experiment requires exactly one control variant, found {controls}"
            )));
        }
        for variant in &config.variants {
            if !config.allocation.contains_key(&variant.id) {
                return Err(AnalyticsError::Validation(format!(
                    "variant '{}' has no allocation entry",
                    variant.id
                )));
            }
        }
        let sum: f64 = config.allocation.values().sum();
        if (sum - 100.0).abs() > ALLOCATION_TOLERANCE {
            return Err(AnalyticsError::Validation(format!(
                "variant allocations must sum to 100, got {sum}"
            )));
        }
        if !(0.0..=1.0).contains(&config.traffic_allocation) {
            return Err(AnalyticsError::Validation(
                "traffic_allocation must be within [0, 1]".into(),
            ));
        }

        let experiment = Experiment {
            id: Uuid::new_v4(),
            name: config.name,
            description: config.description,
            hypothesis: config.hypothesis,
            variants: config.variants,
            allocation: config.allocation,
            metrics: config.metrics,
            primary_metric: config.primary_metric,
            traffic_allocation: config.traffic_allocation,
            status: ExperimentStatus::Draft,
            start_date: None,
            end_date: None,
            results: None,
            winner: None,
            created_at: Utc::now(),
        };
        self.repo.insert(experiment.clone())?;
        info!(test_id = %experiment.id, name = %experiment.name, "Experiment created");
        Ok(experiment)
    }

    pub fn get_experiment(&self, test_id: Uuid) -> AnalyticsResult<Experiment> {
        self.repo
            .get(test_id)?
            .ok_or_else(|| AnalyticsError::NotFound(format!("experiment {test_id}")))
    }

    pub fn list_experiments(&self) -> AnalyticsResult<Vec<Experiment>> {
        self.repo.list()
    }

    /// draft → running, or paused → running.
    pub fn start(&self, test_id: Uuid) -> AnalyticsResult<Experiment> {
        let mut experiment = self.get_experiment(test_id)?;
        match experiment.status {
            ExperimentStatus::Draft | ExperimentStatus::Paused => {
                experiment.status = ExperimentStatus::Running;
                if experiment.start_date.is_none() {
                    experiment.start_date = Some(Utc::now());
                }
                self.repo.update(experiment.clone())?;
                info!(test_id = %test_id, "Experiment started");
                Ok(experiment)
            }
            status => Err(AnalyticsError::Validation(format!(
                "cannot start experiment in {status:?} state"
            ))),
        }
    }

    /// running → paused.
    pub fn pause(&self, test_id: Uuid) -> AnalyticsResult<Experiment> {
        let mut experiment = self.get_experiment(test_id)?;
        if experiment.status != ExperimentStatus::Running {
            return Err(AnalyticsError::Validation(format!(
                "cannot pause experiment in {:?} state",
                experiment.status
            )));
        }
        experiment.status = ExperimentStatus::Paused;
        self.repo.update(experiment.clone())?;
        info!(test_id = %test_id, "Experiment paused");
        Ok(experiment)
    }

    /// Sticky variant assignment. Two independent uniform draws: first
    /// traffic inclusion, then weighted bucketing over the ordered
    /// variant list. A user excluded by the inclusion draw observes the
    /// control variant with no persisted row.
    pub fn assign_variant(&self, test_id: Uuid, user_id: &str) -> AnalyticsResult<String> {
        if let Some(existing) = self.repo.assignment(test_id, user_id)? {
            return Ok(existing.variant);
        }

        let experiment = self.get_experiment(test_id)?;
        if experiment.status != ExperimentStatus::Running {
            return Err(AnalyticsError::NotRunning(format!(
                "experiment {test_id} is {:?}",
                experiment.status
            )));
        }
        let control = experiment
            .control()
            .ok_or_else(|| AnalyticsError::Validation("experiment has no control variant".into()))?;

        let mut rng = rand::thread_rng();
        let inclusion: f64 = rng.gen_range(0.0..100.0);
        if inclusion > experiment.traffic_allocation * 100.0 {
            // Not in the experiment; behaves as baseline.
            return Ok(control.id.clone());
        }

        let bucket: f64 = rng.gen_range(0.0..100.0);
        let variant = Self::pick_variant(&experiment.variants, &experiment.allocation, bucket);

        let assignment = Assignment {
            test_id,
            user_id: user_id.to_string(),
            variant: variant.id.clone(),
            converted: false,
            converted_at: None,
            value: None,
            assigned_at: Utc::now(),
        };
        let stored = self.repo.insert_assignment_if_absent(assignment.clone())?;
        if stored.assigned_at == assignment.assigned_at && stored.variant == assignment.variant {
            // This call won the insert; anything else was a lost race.
            self.events.append(
                AnalyticsEvent::named(AB_TEST_ASSIGNED)
                    .with_user(user_id)
                    .with_category("experiments")
                    .with_property("test_id", serde_json::json!(test_id))
                    .with_property("variant", serde_json::json!(stored.variant)),
            )?;
            metrics::counter!("experiments.assignments.created").increment(1);
        }
        Ok(stored.variant)
    }

    /// Weighted bucketing: walk variants in order accumulating their
    /// allocation until the cumulative sum reaches the draw. First match
    /// wins; a draw past the total falls through to the last variant.
    fn pick_variant<'a>(
        variants: &'a [Variant],
        allocation: &HashMap<String, f64>,
        draw: f64,
    ) -> &'a Variant {
        let mut cumulative = 0.0;
        for variant in variants {
            cumulative += allocation.get(&variant.id).copied().unwrap_or(0.0);
            if cumulative >= draw {
                return variant;
            }
        }
        &variants[variants.len() - 1]
    }

    /// At-most-once conversion. No-op when no assignment exists or the
    /// assignment already converted.
    pub fn track_conversion(
        &self,
        test_id: Uuid,
        user_id: &str,
        value: Option<f64>,
    ) -> AnalyticsResult<()> {
        let experiment = self.get_experiment(test_id)?;
        if experiment.status != ExperimentStatus::Running {
            return Err(AnalyticsError::NotRunning(format!(
                "experiment {test_id} is {:?}",
                experiment.status
            )));
        }
        let Some(mut assignment) = self.repo.assignment(test_id, user_id)? else {
            return Ok(());
        };
        if assignment.converted {
            return Ok(());
        }

        assignment.converted = true;
        assignment.converted_at = Some(Utc::now());
        assignment.value = value;
        self.repo.update_assignment(assignment.clone())?;
        self.events.append(
            AnalyticsEvent::named(AB_TEST_CONVERTED)
                .with_user(user_id)
                .with_category("experiments")
                .with_property("test_id", serde_json::json!(test_id))
                .with_property("variant", serde_json::json!(assignment.variant)),
        )?;
        metrics::counter!("experiments.conversions.recorded").increment(1);
        Ok(())
    }

    /// Per-variant counters, plus the two-proportion z-test when the
    /// experiment has exactly two variants.
    pub fn get_results(&self, test_id: Uuid) -> AnalyticsResult<ExperimentResults> {
        let experiment = self.get_experiment(test_id)?;
        let assignments = self.repo.assignments_for(test_id)?;

        let mut variants = HashMap::new();
        let mut samples = Vec::with_capacity(experiment.variants.len());
        for variant in &experiment.variants {
            let participants = assignments.iter().filter(|a| a.variant == variant.id);
            let n = participants.clone().count() as u64;
            let converted: Vec<&Assignment> =
                participants.filter(|a| a.converted).collect();
            let x = converted.len() as u64;
            let total_value: f64 = converted.iter().filter_map(|a| a.value).sum();
            variants.insert(
                variant.id.clone(),
                VariantResults {
                    participants: n,
                    conversions: x,
                    conversion_rate: if n > 0 { x as f64 / n as f64 * 100.0 } else { 0.0 },
                    avg_value: if x > 0 { total_value / x as f64 } else { 0.0 },
                },
            );
            samples.push((x, n));
        }

        let (z_score, confidence, significant) = if let [(x1, n1), (x2, n2)] = samples[..] {
            let z = stats::two_proportion_z(x1, n1, x2, n2);
            let confidence = stats::confidence_level(z);
            (Some(z), Some(confidence), Some(stats::is_significant(confidence)))
        } else {
            (None, None, None)
        };

        Ok(ExperimentResults {
            variants,
            z_score,
            confidence,
            significant,
            computed_at: Utc::now(),
        })
    }

    /// Compute final results, record the winner, and transition to
    /// `completed`. Irreversible.
    pub fn declare_winner(&self, test_id: Uuid, winner: &str) -> AnalyticsResult<Experiment> {
        let experiment = self.get_experiment(test_id)?;
        if !experiment.variants.iter().any(|v| v.id == winner) {
            return Err(AnalyticsError::Validation(format!(
                "'{winner}' is not a variant of experiment {test_id}"
            )));
        }
        self.finish(experiment, Some(winner.to_string()))
    }

    /// Transition to `completed` without naming a winner.
    pub fn complete(&self, test_id: Uuid) -> AnalyticsResult<Experiment> {
        let experiment = self.get_experiment(test_id)?;
        self.finish(experiment, None)
    }

    fn finish(
        &self,
        mut experiment: Experiment,
        winner: Option<String>,
    ) -> AnalyticsResult<Experiment> {
        match experiment.status {
            ExperimentStatus::Running | ExperimentStatus::Paused => {}
            status => {
                return Err(AnalyticsError::Validation(format!(
                    "cannot complete experiment in {status:?} state"
                )))
            }
        }
        experiment.results = Some(self.get_results(experiment.id)?);
        experiment.winner = winner;
        experiment.status = ExperimentStatus::Completed;
        experiment.end_date = Some(Utc::now());
        self.repo.update(experiment.clone())?;
        info!(
            test_id = %experiment.id,
            winner = experiment.winner.as_deref().unwrap_or("none"),
            "Experiment completed"
        );
        Ok(experiment)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pulse_store::{EventQuery, MemoryEventStore, MemoryExperimentStore};

    fn manager() -> (ExperimentManager, Arc<MemoryExperimentStore>, Arc<MemoryEventStore>) {
        let repo = Arc::new(MemoryExperimentStore::new());
        let events = Arc::new(MemoryEventStore::new());
        (
            ExperimentManager::new(repo.clone(), events.clone()),
            repo,
            events,
        )
    }

    fn two_variant_config(traffic_allocation: f64) -> ExperimentConfig {
        ExperimentConfig {
            name: "checkout-cta".into(),
            description: None,
            hypothesis: Some("larger CTA increases enrollments".into()),
            variants: vec![
                Variant {
                    id: "control".into(),
                    name: "Current CTA".into(),
                    role: VariantRole::Control,
                },
                Variant {
                    id: "large-cta".into(),
                    name: "Large CTA".into(),
                    role: VariantRole::Treatment,
                },
            ],
            allocation: HashMap::from([("control".into(), 50.0), ("large-cta".into(), 50.0)]),
            metrics: vec!["enrollment_rate".into()],
            primary_metric: "enrollment_rate".into(),
            traffic_allocation,
        }
    }

    fn started(manager: &ExperimentManager, config: ExperimentConfig) -> Experiment {
        let experiment = manager.create_experiment(config).unwrap();
        manager.start(experiment.id).unwrap()
    }

    #[test]
    fn test_allocation_must_sum_to_hundred() {
        let (manager, _, _) = manager();
        let mut config = two_variant_config(1.0);
        config.allocation.insert("large-cta".into(), 49.0);
        assert!(matches!(
            manager.create_experiment(config),
            Err(AnalyticsError::Validation(_))
        ));

        // Within the 0.01 tolerance passes.
        let mut config = two_variant_config(1.0);
        config.allocation.insert("large-cta".into(), 50.005);
        assert!(manager.create_experiment(config).is_ok());
    }

    #[test]
    fn test_exactly_one_control_required() {
        let (manager, _, _) = manager();
        let mut config = two_variant_config(1.0);
        config.variants[1].role = VariantRole::Control;
        assert!(matches!(
            manager.create_experiment(config),
            Err(AnalyticsError::Validation(_))
        ));
    }

    #[test]
    fn test_assignment_requires_running_experiment() {
        let (manager, _, _) = manager();
        let experiment = manager.create_experiment(two_variant_config(1.0)).unwrap();
        assert!(matches!(
            manager.assign_variant(experiment.id, "u1"),
            Err(AnalyticsError::NotRunning(_))
        ));
        assert!(matches!(
            manager.assign_variant(Uuid::new_v4(), "u1"),
            Err(AnalyticsError::NotFound(_))
        ));
    }

    #[test]
    fn test_assignment_is_sticky() {
        let (manager, _, _) = manager();
        let experiment = started(&manager, two_variant_config(1.0));
        let first = manager.assign_variant(experiment.id, "u1").unwrap();
        for _ in 0..10 {
            assert_eq!(manager.assign_variant(experiment.id, "u1").unwrap(), first);
        }
    }

    #[test]
    fn test_even_split_over_many_assignments() {
        let (manager, _, _) = manager();
        let experiment = started(&manager, two_variant_config(1.0));
        let mut control = 0u32;
        for i in 0..10_000 {
            if manager.assign_variant(experiment.id, &format!("u{i}")).unwrap() == "control" {
                control += 1;
            }
        }
        // 50/50 split; ±5% absolute is far beyond sampling noise.
        assert!((4500..=5500).contains(&control), "control count {control}");
    }

    #[test]
    fn test_excluded_users_observe_control_without_persisted_row() {
        let (manager, repo, _) = manager();
        let experiment = started(&manager, two_variant_config(0.0));
        for i in 0..50 {
            let variant = manager.assign_variant(experiment.id, &format!("u{i}")).unwrap();
            assert_eq!(variant, "control");
        }
        assert!(repo.assignments_for(experiment.id).unwrap().is_empty());
    }

    #[test]
    fn test_assignment_emits_event() {
        let (manager, _, events) = manager();
        let experiment = started(&manager, two_variant_config(1.0));
        manager.assign_variant(experiment.id, "u1").unwrap();
        manager.assign_variant(experiment.id, "u1").unwrap();
        let emitted = events
            .query(&EventQuery::for_event(AB_TEST_ASSIGNED))
            .unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_conversion_is_at_most_once() {
        let (manager, repo, events) = manager();
        let experiment = started(&manager, two_variant_config(1.0));
        manager.assign_variant(experiment.id, "u1").unwrap();

        manager.track_conversion(experiment.id, "u1", Some(29.0)).unwrap();
        let first = repo.assignment(experiment.id, "u1").unwrap().unwrap();
        assert!(first.converted);
        assert_eq!(first.value, Some(29.0));

        manager.track_conversion(experiment.id, "u1", Some(99.0)).unwrap();
        let second = repo.assignment(experiment.id, "u1").unwrap().unwrap();
        assert_eq!(second.converted_at, first.converted_at);
        assert_eq!(second.value, Some(29.0));

        let emitted = events.query(&EventQuery::for_event(AB_TEST_CONVERTED)).unwrap();
        assert_eq!(emitted.len(), 1);
    }

    #[test]
    fn test_conversion_without_assignment_is_noop() {
        let (manager, _, _) = manager();
        let experiment = started(&manager, two_variant_config(1.0));
        assert!(manager.track_conversion(experiment.id, "ghost", None).is_ok());
    }

    #[test]
    fn test_results_with_reference_counts() {
        let (manager, repo, _) = manager();
        let experiment = started(&manager, two_variant_config(1.0));
        // Seed assignments directly: control 100/1000, treatment 150/1000.
        for (variant, total, conversions) in [("control", 1000, 100), ("large-cta", 1000, 150)] {
            for i in 0..total {
                let converted = i < conversions;
                repo.insert_assignment_if_absent(Assignment {
                    test_id: experiment.id,
                    user_id: format!("{variant}-{i}"),
                    variant: variant.into(),
                    converted,
                    converted_at: converted.then(Utc::now),
                    value: converted.then_some(30.0),
                    assigned_at: Utc::now(),
                })
                .unwrap();
            }
        }

        let results = manager.get_results(experiment.id).unwrap();
        let control = &results.variants["control"];
        assert_eq!(control.participants, 1000);
        assert_eq!(control.conversions, 100);
        assert!((control.conversion_rate - 10.0).abs() < 1e-9);
        assert!((control.avg_value - 30.0).abs() < 1e-9);
        assert_eq!(results.confidence, Some(0.99));
        assert_eq!(results.significant, Some(true));
    }

    #[test]
    fn test_results_with_no_participants() {
        let (manager, _, _) = manager();
        let experiment = started(&manager, two_variant_config(1.0));
        let results = manager.get_results(experiment.id).unwrap();
        assert_eq!(results.variants["control"].conversion_rate, 0.0);
        assert_eq!(results.confidence, Some(0.0));
        assert_eq!(results.significant, Some(false));
    }

    #[test]
    fn test_declare_winner_is_terminal() {
        let (manager, _, _) = manager();
        let experiment = started(&manager, two_variant_config(1.0));
        manager.assign_variant(experiment.id, "u1").unwrap();

        let completed = manager.declare_winner(experiment.id, "large-cta").unwrap();
        assert_eq!(completed.status, ExperimentStatus::Completed);
        assert_eq!(completed.winner.as_deref(), Some("large-cta"));
        assert!(completed.results.is_some());
        assert!(completed.end_date.is_some());

        // No resurrection and no further traffic.
        assert!(manager.start(experiment.id).is_err());
        assert!(matches!(
            manager.assign_variant(experiment.id, "u2"),
            Err(AnalyticsError::NotRunning(_))
        ));
    }

    #[test]
    fn test_pause_resume_cycle() {
        let (manager, _, _) = manager();
        let experiment = started(&manager, two_variant_config(1.0));
        manager.pause(experiment.id).unwrap();
        assert!(matches!(
            manager.assign_variant(experiment.id, "u1"),
            Err(AnalyticsError::NotRunning(_))
        ));
        let resumed = manager.start(experiment.id).unwrap();
        assert_eq!(resumed.status, ExperimentStatus::Running);
        assert!(manager.assign_variant(experiment.id, "u1").is_ok());
    }

    #[test]
    fn test_declare_winner_rejects_unknown_variant() {
        let (manager, _, _) = manager();
        let experiment = started(&manager, two_variant_config(1.0));
        assert!(matches!(
            manager.declare_winner(experiment.id, "nope"),
            Err(AnalyticsError::Validation(_))
        ));
    }
}
