//! Metric store — periodized time series, derived aggregates, and the
//! scheduler-driven event roll-up.

#![warn(clippy::unwrap_used)]

pub mod aggregator;
pub mod service;

pub use aggregator::{AggregationRule, MetricAggregator, ACTIVE_USERS_METRIC};
pub use service::{EventCount, MetricService, MetricWrite};
