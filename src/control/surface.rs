//! Administrative surface: enable/disable, telemetry stat snapshots, and the
//! single-byte command protocol.
//!
//! This is the only place raw administrative input is validated; malformed
//! commands never reach the state machine.

#![allow(missing_docs)]

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::boost::controller::BoostController;
use crate::core::errors::{Result, SibError};
use crate::logger::activity::ActivityEvent;
use crate::monitor::telemetry::TelemetryData;

/// Number of words in the fixed stat layout.
pub const IO_STAT_WORDS: usize = 7;

/// Telemetry counters as handed to the control surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoStatSnapshot {
    pub data: TelemetryData,
    /// False when the source was not collecting; `data` is then all zeros.
    pub collecting: bool,
}

impl IoStatSnapshot {
    /// Fixed word order: workload level, top pages, read/write request counts,
    /// queue depth, read/write request sizes.
    #[must_use]
    pub const fn words(&self) -> [i32; IO_STAT_WORDS] {
        let d = &self.data;
        [
            d.workload_level,
            d.top_pages,
            d.read_requests,
            d.write_requests,
            d.queue_depth,
            d.read_request_size,
            d.write_request_size,
        ]
    }

    /// The first `limit` words; a caller buffer larger than the layout gets all seven.
    #[must_use]
    pub fn to_words(&self, limit: usize) -> Vec<i32> {
        self.words()[..limit.min(IO_STAT_WORDS)].to_vec()
    }
}

/// Thin adapter between an administrative client and a [`BoostController`].
#[derive(Debug)]
pub struct ControlSurface {
    controller: Arc<BoostController>,
    // Serializes stat reads with collect switches.
    collect_lock: Mutex<()>,
}

impl ControlSurface {
    #[must_use]
    pub fn new(controller: Arc<BoostController>) -> Self {
        Self {
            controller,
            collect_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<BoostController> {
        &self.controller
    }

    pub fn enable(&self) {
        self.controller.set_enabled(true);
    }

    pub fn disable(&self) {
        self.controller.set_enabled(false);
    }

    /// Current telemetry counters for the monitored target.
    ///
    /// If the source is not collecting, collection is switched on and a zeroed
    /// snapshot is returned. Controller state is never touched.
    pub fn get_stats(&self) -> IoStatSnapshot {
        let _guard = self.collect_lock.lock();
        self.read_stats()
    }

    /// Decode one administrative command. Only the first byte is considered.
    ///
    /// `'1'` enables boosting, `'0'` relaxes and disables it. Returns the number
    /// of bytes consumed.
    pub fn handle_command(&self, raw: &[u8]) -> Result<usize> {
        self.handle_command_at(raw, Instant::now())
    }

    /// [`ControlSurface::handle_command`] for a caller on its own clock: a relax
    /// restarts the traffic window at `now`.
    pub fn handle_command_at(&self, raw: &[u8], now: Instant) -> Result<usize> {
        match raw.first().copied() {
            Some(b'1') => {
                self.controller.set_enabled_at(true, now);
                Ok(1)
            }
            Some(b'0') => {
                self.controller.set_enabled_at(false, now);
                Ok(1)
            }
            byte => {
                let err = SibError::InvalidCommand { byte };
                eprintln!("[SIB-CTRL] {err}");
                if let Some(logger) = self.controller.logger() {
                    logger.send(ActivityEvent::InvalidCommand { byte });
                }
                Err(err)
            }
        }
    }

    /// Collection switch: `true` samples telemetry (enabling it if needed),
    /// `false` relaxes any active boost without disabling the controller.
    pub fn switch_collect(&self, on: bool) {
        let _guard = self.collect_lock.lock();
        if on {
            let _ = self.read_stats();
        } else {
            self.controller.request_boost(false);
        }
    }

    /// Human-readable status block with the command legend.
    #[must_use]
    pub fn status_report(&self) -> String {
        let c = &self.controller;
        let mut out = String::new();
        let _ = writeln!(out, "<SIB Boost Control Unit>");
        let _ = writeln!(out, "Monitor Storage Type: {}", c.target());
        let _ = writeln!(out, "Status:");
        let _ = writeln!(out, "  Boost Control Enable: {}", u8::from(c.is_enabled()));
        let _ = writeln!(out, "  Boosted: {}", u8::from(c.is_boosted()));
        let _ = writeln!(out, "Commands (first byte written to the control surface):");
        let _ = writeln!(out, "  Enable boost control  : 1");
        let _ = writeln!(out, "  Disable boost control : 0");
        out
    }

    fn read_stats(&self) -> IoStatSnapshot {
        let target = self.controller.target();
        let telemetry = self.controller.telemetry();
        match telemetry.snapshot(target) {
            Ok(data) => IoStatSnapshot {
                data,
                collecting: true,
            },
            Err(_) => {
                telemetry.enable(target, true);
                if let Some(logger) = self.controller.logger() {
                    logger.send(ActivityEvent::TelemetryEnabled {
                        target: target.to_string(),
                    });
                }
                IoStatSnapshot::default()
            }
        }
    }
}
