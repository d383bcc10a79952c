//! Boost decision and announcement: state machine, convergence notifier,
//! and the listener seam.

pub mod announce;
pub mod controller;
pub mod notifier;
