//! Storage layer — repository traits and in-memory backends for the
//! five persisted collections: events, metrics, experiments and
//! assignments, funnels and funnel events, predictions.

#![warn(clippy::unwrap_used)]

pub mod events;
pub mod memory;
pub mod repository;

pub use events::{EventData, EventRecorder};
pub use memory::{
    MemoryEventStore, MemoryExperimentStore, MemoryFunnelStore, MemoryMetricStore,
    MemoryPredictionStore,
};
pub use repository::{
    EventQuery, EventRepository, ExperimentRepository, FunnelRepository, MetricRepository,
    PredictionRepository, DEFAULT_QUERY_LIMIT,
};
