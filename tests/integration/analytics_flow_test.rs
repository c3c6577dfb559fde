//! Integration test for the full event-to-insight flow: record events,
//! roll them up, run an experiment end to end, walk a funnel, and
//! produce a forecast — all against the in-memory stores.

#[cfg(test)]
mod tests {
    use pulse_core::config::ForecastConfig;
    use pulse_core::types::{
        ExperimentStatus, FunnelStep, MetricPeriod, PredictionType, Variant, VariantRole,
        ORDER_AMOUNT_PROPERTY, ORDER_COMPLETED_EVENT, SIGNUP_EVENT,
    };
    use pulse_experiments::{ExperimentConfig, ExperimentManager};
    use pulse_forecast::Forecaster;
    use pulse_funnels::{FunnelConfig, FunnelTracker};
    use pulse_metrics::{AggregationRule, MetricAggregator, MetricService};
    use pulse_store::{
        EventData, EventRecorder, MemoryEventStore, MemoryExperimentStore, MemoryFunnelStore,
        MemoryMetricStore, MemoryPredictionStore,
    };
    use std::collections::HashMap;
    use std::sync::Arc;

    struct Engine {
        recorder: EventRecorder,
        metrics: Arc<MetricService>,
        aggregator: MetricAggregator,
        experiments: ExperimentManager,
        funnels: FunnelTracker,
        forecaster: Forecaster,
    }

    fn engine() -> Engine {
        let events = Arc::new(MemoryEventStore::new());
        let metric_store = Arc::new(MemoryMetricStore::new());
        let metrics = Arc::new(MetricService::new(metric_store.clone(), events.clone()));
        Engine {
            recorder: EventRecorder::new(events.clone()),
            metrics: metrics.clone(),
            aggregator: MetricAggregator::new(metrics, events.clone()),
            experiments: ExperimentManager::new(
                Arc::new(MemoryExperimentStore::new()),
                events.clone(),
            ),
            funnels: FunnelTracker::new(Arc::new(MemoryFunnelStore::new()), events.clone()),
            forecaster: Forecaster::new(
                &ForecastConfig::default(),
                metric_store,
                events,
                Arc::new(MemoryPredictionStore::new()),
            ),
        }
    }

    fn sample_event(event: &str, user: &str) -> EventData {
        EventData {
            event: event.to_string(),
            user_id: Some(user.to_string()),
            session_id: Some(format!("{user}-s1")),
            category: Some("growth".to_string()),
            properties: HashMap::new(),
            page: Some("/welcome".to_string()),
            referrer: None,
            user_agent: Some("Mozilla/5.0".to_string()),
        }
    }

    fn experiment_config() -> ExperimentConfig {
        ExperimentConfig {
            name: "onboarding-copy".to_string(),
            description: None,
            hypothesis: Some("Shorter copy converts better".to_string()),
            variants: vec![
                Variant {
                    id: "control".to_string(),
                    name: "Current copy".to_string(),
                    role: VariantRole::Control,
                },
                Variant {
                    id: "short".to_string(),
                    name: "Short copy".to_string(),
                    role: VariantRole::Treatment,
                },
            ],
            allocation: HashMap::from([("control".to_string(), 50.0), ("short".to_string(), 50.0)]),
            metrics: vec![],
            primary_metric: "signup_rate".to_string(),
            traffic_allocation: 1.0,
        }
    }

    #[test]
    fn test_events_roll_up_into_metrics() {
        let engine = engine();
        for i in 0..5 {
            engine
                .recorder
                .record(sample_event(SIGNUP_EVENT, &format!("u{i}")))
                .unwrap();
        }

        engine.aggregator.register(AggregationRule {
            metric: "signups_daily".to_string(),
            event: SIGNUP_EVENT.to_string(),
            period: MetricPeriod::Daily,
        });
        engine.aggregator.run(MetricPeriod::Daily).unwrap();

        let series = engine
            .metrics
            .get_metrics("signups_daily", MetricPeriod::Daily, 7)
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].value, 5.0);

        assert_eq!(
            engine
                .metrics
                .calculate_active_users(MetricPeriod::Daily)
                .unwrap(),
            5
        );
    }

    #[test]
    fn test_experiment_end_to_end() {
        let engine = engine();
        let experiment = engine
            .experiments
            .create_experiment(experiment_config())
            .unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Draft);

        engine.experiments.start(experiment.id).unwrap();

        let mut by_variant: HashMap<String, Vec<String>> = HashMap::new();
        for i in 0..200 {
            let user = format!("u{i}");
            let variant = engine
                .experiments
                .assign_variant(experiment.id, &user)
                .unwrap();
            // Sticky: a second call returns the same variant.
            assert_eq!(
                engine
                    .experiments
                    .assign_variant(experiment.id, &user)
                    .unwrap(),
                variant
            );
            by_variant.entry(variant).or_default().push(user);
        }
        assert_eq!(by_variant.len(), 2);

        // Convert every treatment user and no control users.
        for user in &by_variant["short"] {
            engine
                .experiments
                .track_conversion(experiment.id, user, Some(9.99))
                .unwrap();
        }

        let results = engine.experiments.get_results(experiment.id).unwrap();
        assert_eq!(results.variants["short"].conversion_rate, 100.0);
        assert_eq!(results.variants["control"].conversion_rate, 0.0);
        assert!(results.significant.unwrap());

        let finished = engine
            .experiments
            .declare_winner(experiment.id, "short")
            .unwrap();
        assert_eq!(finished.status, ExperimentStatus::Completed);
        assert_eq!(finished.winner.as_deref(), Some("short"));

        // A completed experiment no longer assigns.
        assert!(engine
            .experiments
            .assign_variant(experiment.id, "late-user")
            .is_err());
    }

    #[test]
    fn test_funnel_end_to_end() {
        let engine = engine();
        let funnel = engine
            .funnels
            .create_funnel(FunnelConfig {
                name: "checkout".to_string(),
                steps: vec![
                    FunnelStep {
                        name: "View cart".to_string(),
                        event: "cart_viewed".to_string(),
                        order: 0,
                    },
                    FunnelStep {
                        name: "Enter payment".to_string(),
                        event: "payment_entered".to_string(),
                        order: 1,
                    },
                    FunnelStep {
                        name: "Purchase".to_string(),
                        event: ORDER_COMPLETED_EVENT.to_string(),
                        order: 2,
                    },
                ],
                time_window_minutes: 60,
            })
            .unwrap();

        // Three users enter, two reach payment, one purchases.
        for user in ["u1", "u2", "u3"] {
            engine.funnels.track_step(funnel.id, user, "s1", 0).unwrap();
        }
        for user in ["u1", "u2"] {
            engine.funnels.track_step(funnel.id, user, "s1", 1).unwrap();
        }
        engine.funnels.track_step(funnel.id, "u1", "s1", 2).unwrap();

        let results = engine.funnels.get_funnel_results(funnel.id, None).unwrap();
        assert_eq!(results[0].users, 3);
        assert_eq!(results[1].users, 2);
        assert_eq!(results[2].users, 1);
        assert_eq!(results[0].dropoff, 0);
        assert_eq!(results[1].dropoff, 1);

        let analysis = engine.funnels.get_dropoff_analysis(funnel.id, None).unwrap();
        assert_eq!(analysis.total_dropoff, 2);
    }

    #[test]
    fn test_forecast_from_recorded_orders() {
        let engine = engine();
        for i in 0..10 {
            engine
                .recorder
                .record(EventData {
                    properties: HashMap::from([(
                        ORDER_AMOUNT_PROPERTY.to_string(),
                        serde_json::json!(50.0),
                    )]),
                    ..sample_event(ORDER_COMPLETED_EVENT, &format!("u{i}"))
                })
                .unwrap();
        }
        // Recent-only history: growth rate is computed but the mean
        // daily baseline still projects a positive total.
        let predicted = engine.forecaster.predict_revenue(30).unwrap();
        assert!(predicted > 0.0);

        let accuracy_before = engine
            .forecaster
            .calculate_prediction_accuracy(PredictionType::Revenue)
            .unwrap();
        assert_eq!(accuracy_before, 0.0);
    }
}
