//! Conversion funnels — step tracking and drop-off analysis.

#![warn(clippy::unwrap_used)]

pub mod tracker;

pub use tracker::{DropoffAnalysis, FunnelConfig, FunnelTracker, StepResult, WorstStep};
