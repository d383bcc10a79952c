//! Telemetry collaborator: the narrow accessor surface the booster needs from the
//! block-I/O workload monitor, plus an in-process implementation.

#![allow(missing_docs)]

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SibError};

/// Names the storage target a controller observes. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonitoredTargetId(String);

impl MonitoredTargetId {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MonitoredTargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw workload measurements reported by the telemetry source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryData {
    /// Workload classification level.
    pub workload_level: i32,
    /// Top-of-window page count.
    pub top_pages: i32,
    pub read_requests: i32,
    pub write_requests: i32,
    pub queue_depth: i32,
    pub read_request_size: i32,
    pub write_request_size: i32,
}

/// Workload telemetry accessor consumed by the booster.
pub trait TelemetrySource: Send + Sync {
    /// Current measurements. An error means the source is not collecting for `target`.
    fn snapshot(&self, target: &MonitoredTargetId) -> Result<TelemetryData>;
    /// Start or stop sampling for `target`.
    fn enable(&self, target: &MonitoredTargetId, on: bool);
    /// Advisory hint: the controller just confirmed it is not boosted.
    fn on_window_checked(&self, target: &MonitoredTargetId);
}

#[derive(Debug, Default)]
struct SampledState {
    collecting: bool,
    latest: TelemetryData,
    window_checks: u64,
    enable_calls: u64,
}

/// Telemetry source fed by the host: measurements are pushed with
/// [`SampledTelemetry::publish`] and served until replaced.
#[derive(Debug, Default)]
pub struct SampledTelemetry {
    state: Mutex<SampledState>,
}

impl SampledTelemetry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the latest measurements.
    pub fn publish(&self, data: TelemetryData) {
        self.state.lock().latest = data;
    }

    #[must_use]
    pub fn is_collecting(&self) -> bool {
        self.state.lock().collecting
    }

    /// Number of `on_window_checked` hints received.
    #[must_use]
    pub fn window_checks(&self) -> u64 {
        self.state.lock().window_checks
    }

    /// Number of `enable` calls received (either direction).
    #[must_use]
    pub fn enable_calls(&self) -> u64 {
        self.state.lock().enable_calls
    }
}

impl TelemetrySource for SampledTelemetry {
    fn snapshot(&self, target: &MonitoredTargetId) -> Result<TelemetryData> {
        let state = self.state.lock();
        if state.collecting {
            Ok(state.latest)
        } else {
            Err(SibError::TelemetryUnavailable {
                target: target.to_string(),
                details: "not collecting".to_string(),
            })
        }
    }

    fn enable(&self, _target: &MonitoredTargetId, on: bool) {
        let mut state = self.state.lock();
        state.collecting = on;
        state.enable_calls += 1;
    }

    fn on_window_checked(&self, _target: &MonitoredTargetId) {
        self.state.lock().window_checks += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TelemetryData {
        TelemetryData {
            workload_level: 2,
            top_pages: 9_000,
            read_requests: 40,
            write_requests: 12,
            queue_depth: 8,
            read_request_size: 131_072,
            write_request_size: 65_536,
        }
    }

    #[test]
    fn snapshot_fails_until_enabled() {
        let target = MonitoredTargetId::new("ufs");
        let telemetry = SampledTelemetry::new();
        telemetry.publish(sample());

        let err = telemetry.snapshot(&target).expect_err("not collecting yet");
        assert_eq!(err.code(), "SIB-2003");
        assert!(err.to_string().contains("ufs"));

        telemetry.enable(&target, true);
        assert_eq!(telemetry.snapshot(&target).expect("collecting"), sample());
        assert_eq!(telemetry.enable_calls(), 1);
    }

    #[test]
    fn disabling_stops_snapshots() {
        let target = MonitoredTargetId::new("mmc");
        let telemetry = SampledTelemetry::new();
        telemetry.enable(&target, true);
        telemetry.enable(&target, false);
        assert!(!telemetry.is_collecting());
        assert!(telemetry.snapshot(&target).is_err());
    }

    #[test]
    fn window_check_hints_are_counted() {
        let target = MonitoredTargetId::new("ufs");
        let telemetry = SampledTelemetry::new();
        telemetry.on_window_checked(&target);
        telemetry.on_window_checked(&target);
        assert_eq!(telemetry.window_checks(), 2);
    }

    #[test]
    fn target_id_serializes_as_plain_string() {
        let id = MonitoredTargetId::new("ufs");
        assert_eq!(serde_json::to_string(&id).expect("json"), "\"ufs\"");
        assert_eq!(id.to_string(), "ufs");
    }
}
