//! Operational HTTP endpoints (health probes, metrics).

mod health;

pub use health::{health_check, health_components, health_detailed, metrics_endpoint};
