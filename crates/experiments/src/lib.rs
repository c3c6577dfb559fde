//! A/B experimentation — lifecycle state machine, deterministic-by-storage
//! sticky assignment, conversion tracking, and significance testing.

#![warn(clippy::unwrap_used)]

pub mod manager;
pub mod stats;

pub use manager::{ExperimentConfig, ExperimentManager};
