//! HTTP surface over the analytics services.

#![warn(clippy::unwrap_used)]

pub mod handlers;
pub mod server;

pub use handlers::{ApiState, ErrorResponse};
pub use server::ApiServer;
