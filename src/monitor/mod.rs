//! Traffic monitoring: the sliding page window and the telemetry collaborator.

pub mod telemetry;
pub mod window;
