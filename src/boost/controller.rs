//! Boost state machine for one monitored storage target.
//!
//! States: disabled, idle (enabled, not boosted), boosted. The traffic window and
//! the enabled/boosted flags live behind one mutex. Announcements are handed to
//! the [`ConvergenceNotifier`] and never made while that mutex is held.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::boost::announce::Announcer;
use crate::boost::notifier::{ConvergenceNotifier, NotifierStats};
use crate::core::config::Config;
use crate::core::errors::Result;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::monitor::telemetry::{MonitoredTargetId, TelemetrySource};
use crate::monitor::window::WindowAccumulator;

/// Result of one [`BoostController::request_boost`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoostOutcome {
    /// Requested state already in effect, or the controller is disabled.
    Unchanged,
    /// Local state flipped and an announcement was requested.
    Changed,
    /// Boost was requested but neither direction reached the threshold.
    ThresholdNotMet,
}

/// Point-in-time view of the controller for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControllerSnapshot {
    pub enabled: bool,
    pub boosted: bool,
    pub requested_boost: bool,
    pub published_boost: bool,
    pub read_pages: u64,
    pub write_pages: u64,
    pub window_age: Duration,
}

#[derive(Debug)]
struct ControllerCore {
    window: WindowAccumulator,
    enabled: bool,
    boosted: bool,
}

/// What a locked transition left for the caller to do after unlocking.
struct Transition {
    outcome: BoostOutcome,
    change: Option<ActivityEvent>,
    window_checked: bool,
}

impl Transition {
    const fn unchanged() -> Self {
        Self {
            outcome: BoostOutcome::Unchanged,
            change: None,
            window_checked: false,
        }
    }
}

/// Decides when the monitored target deserves a boost and keeps listeners informed.
pub struct BoostController {
    target: MonitoredTargetId,
    window_width: Duration,
    core: Mutex<ControllerCore>,
    telemetry: Arc<dyn TelemetrySource>,
    notifier: ConvergenceNotifier,
    logger: Option<ActivityLoggerHandle>,
}

impl std::fmt::Debug for BoostController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoostController")
            .field("target", &self.target)
            .field("window_width", &self.window_width)
            .field("core", &*self.core.lock())
            .finish_non_exhaustive()
    }
}

impl BoostController {
    /// Build a controller, start its notifier, and switch telemetry collection on.
    ///
    /// The config is validated first; an invalid one is `SibError::InvalidConfig`.
    ///
    /// The window opens at construction time; boosting is permitted according
    /// to `control.start_enabled`.
    pub fn new(
        config: &Config,
        telemetry: Arc<dyn TelemetrySource>,
        announcer: Arc<dyn Announcer>,
        logger: Option<ActivityLoggerHandle>,
    ) -> Result<Self> {
        config.validate()?;
        let target = MonitoredTargetId::new(config.control.target.trim());
        let notifier = ConvergenceNotifier::spawn(&config.notifier, announcer, logger.clone())?;
        let core = ControllerCore {
            window: WindowAccumulator::from_config(Instant::now(), &config.window),
            enabled: config.control.start_enabled,
            boosted: false,
        };

        telemetry.enable(&target, true);
        if let Some(logger) = &logger {
            let config_hash = match config.stable_hash() {
                Ok(hash) => Some(hash),
                Err(err) => {
                    logger.send(ActivityEvent::Error {
                        code: err.code().to_string(),
                        message: err.to_string(),
                    });
                    None
                }
            };
            logger.send(ActivityEvent::ControllerStarted {
                target: target.to_string(),
                enabled: core.enabled,
                config_hash,
            });
            logger.send(ActivityEvent::TelemetryEnabled {
                target: target.to_string(),
            });
        }

        Ok(Self {
            target,
            window_width: config.window.width(),
            core: Mutex::new(core),
            telemetry,
            notifier,
            logger,
        })
    }

    #[must_use]
    pub const fn target(&self) -> &MonitoredTargetId {
        &self.target
    }

    #[must_use]
    pub const fn window_width(&self) -> Duration {
        self.window_width
    }

    pub(crate) fn telemetry(&self) -> &dyn TelemetrySource {
        self.telemetry.as_ref()
    }

    pub(crate) fn logger(&self) -> Option<&ActivityLoggerHandle> {
        self.logger.as_ref()
    }

    /// Account one completed request against the current window.
    pub fn account_io(&self, is_write: bool, size_bytes: u32) {
        self.core.lock().window.update(is_write, size_bytes);
    }

    pub fn request_boost(&self, on: bool) -> BoostOutcome {
        self.request_boost_at(on, Instant::now())
    }

    /// Evaluate a boost (`on`) or relax (`!on`) request at time `now`.
    ///
    /// Every boost attempt and every successful relax starts a new window at `now`.
    /// A disabled controller ignores the request entirely.
    pub fn request_boost_at(&self, on: bool, now: Instant) -> BoostOutcome {
        let transition = {
            let mut core = self.core.lock();
            self.transition(&mut core, on, now)
        };
        self.finish(transition)
    }

    /// Periodic re-evaluation: once the window is at least one width old, attempt a boost.
    ///
    /// Returns `None` when the window has not elapsed yet.
    pub fn check_elapsed(&self, now: Instant) -> Option<BoostOutcome> {
        let transition = {
            let mut core = self.core.lock();
            if core.window.elapsed(now) < self.window_width {
                return None;
            }
            self.transition(&mut core, true, now)
        };
        Some(self.finish(transition))
    }

    /// Administrative toggle. Disabling relaxes any active boost first.
    pub fn set_enabled(&self, enabled: bool) {
        self.set_enabled_at(enabled, Instant::now());
    }

    /// Like [`BoostController::set_enabled`], with the relax (and its window
    /// restart) taking effect at `now`.
    pub fn set_enabled_at(&self, enabled: bool, now: Instant) {
        let (transition, was_enabled) = {
            let mut core = self.core.lock();
            let was_enabled = core.enabled;
            let transition = if enabled {
                Transition::unchanged()
            } else {
                self.transition(&mut core, false, now)
            };
            core.enabled = enabled;
            (transition, was_enabled)
        };
        self.finish(transition);

        if was_enabled != enabled {
            eprintln!(
                "[SIB-CTRL] boost control for {}: {}",
                self.target,
                if enabled { "allowed" } else { "disallowed" }
            );
            if let Some(logger) = &self.logger {
                logger.send(ActivityEvent::EnabledChanged {
                    target: self.target.to_string(),
                    enabled,
                });
            }
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.core.lock().enabled
    }

    #[must_use]
    pub fn is_boosted(&self) -> bool {
        self.core.lock().boosted
    }

    #[must_use]
    pub fn snapshot(&self, now: Instant) -> ControllerSnapshot {
        let (enabled, boosted, read_pages, write_pages, window_age) = {
            let core = self.core.lock();
            (
                core.enabled,
                core.boosted,
                core.window.read_pages(),
                core.window.write_pages(),
                core.window.elapsed(now),
            )
        };
        let notifier = self.notifier.stats();
        ControllerSnapshot {
            enabled,
            boosted,
            requested_boost: notifier.requested,
            published_boost: notifier.published,
            read_pages,
            write_pages,
            window_age,
        }
    }

    #[must_use]
    pub const fn notifier(&self) -> &ConvergenceNotifier {
        &self.notifier
    }

    #[must_use]
    pub fn notifier_stats(&self) -> NotifierStats {
        self.notifier.stats()
    }

    /// Stop the notifier and record the stop. Safe to call more than once.
    pub fn shutdown(&self, reason: &str) {
        self.notifier.shutdown();
        if let Some(logger) = &self.logger {
            logger.send(ActivityEvent::ControllerStopped {
                target: self.target.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    fn transition(&self, core: &mut ControllerCore, on: bool, now: Instant) -> Transition {
        if !core.enabled {
            return Transition::unchanged();
        }

        let outcome = if on == core.boosted {
            BoostOutcome::Unchanged
        } else if !on || core.window.exceeds_threshold() {
            BoostOutcome::Changed
        } else {
            BoostOutcome::ThresholdNotMet
        };

        let mut change = None;
        if outcome == BoostOutcome::Changed {
            core.boosted = on;
            // Requested under the core lock so concurrent transitions reach the
            // notifier in commit order.
            self.notifier.request(on);
            change = Some(ActivityEvent::BoostChanged {
                target: self.target.to_string(),
                boosted: on,
                read_pages: core.window.read_pages(),
                write_pages: core.window.write_pages(),
            });
        }

        if on || outcome == BoostOutcome::Changed {
            core.window.reset(now);
        }

        Transition {
            outcome,
            change,
            window_checked: matches!(
                (on, outcome),
                (true, BoostOutcome::ThresholdNotMet) | (false, BoostOutcome::Changed)
            ),
        }
    }

    fn finish(&self, transition: Transition) -> BoostOutcome {
        if transition.window_checked {
            self.telemetry.on_window_checked(&self.target);
        }
        if let (Some(logger), Some(event)) = (&self.logger, transition.change) {
            logger.send(event);
        }
        transition.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boost::announce::{BoostEvent, ChannelAnnouncer};
    use crate::monitor::telemetry::SampledTelemetry;
    use crossbeam_channel::Receiver;
    use proptest::prelude::*;

    const MIB: u32 = 1024 * 1024;
    const WAIT: Duration = Duration::from_secs(5);

    struct Rig {
        controller: BoostController,
        telemetry: Arc<SampledTelemetry>,
        announced: Receiver<BoostEvent>,
    }

    fn rig() -> Rig {
        let mut config = Config::default();
        config.notifier.retry_backoff_ms = 1;
        let telemetry = Arc::new(SampledTelemetry::new());
        let (announcer, announced) = ChannelAnnouncer::bounded(64);
        let controller =
            BoostController::new(&config, telemetry.clone(), Arc::new(announcer), None).unwrap();
        Rig {
            controller,
            telemetry,
            announced,
        }
    }

    #[test]
    fn construction_enables_telemetry() {
        let rig = rig();
        assert!(rig.telemetry.is_collecting());
        assert!(rig.controller.is_enabled());
        assert!(!rig.controller.is_boosted());
        assert_eq!(rig.controller.target().as_str(), "ufs");
    }

    #[test]
    fn boost_below_threshold_declines_and_resets() {
        let rig = rig();
        rig.controller.account_io(true, 16 * MIB);
        let now = Instant::now();

        assert_eq!(
            rig.controller.request_boost_at(true, now),
            BoostOutcome::ThresholdNotMet
        );
        let snap = rig.controller.snapshot(now);
        assert!(!snap.boosted);
        assert_eq!((snap.read_pages, snap.write_pages), (0, 0));
        assert_eq!(snap.window_age, Duration::ZERO);
        assert_eq!(rig.telemetry.window_checks(), 1);
        assert!(rig.announced.try_recv().is_err());
    }

    #[test]
    fn boost_above_threshold_changes_and_announces() {
        let rig = rig();
        rig.controller.account_io(false, 32 * MIB);

        assert_eq!(rig.controller.request_boost(true), BoostOutcome::Changed);
        assert!(rig.controller.is_boosted());
        assert_eq!(
            rig.announced.recv_timeout(WAIT).unwrap(),
            BoostEvent::new(true)
        );
        assert_eq!(rig.telemetry.window_checks(), 0);
    }

    #[test]
    fn repeated_boost_is_unchanged_but_still_resets_window() {
        let rig = rig();
        rig.controller.account_io(true, 40 * MIB);
        assert_eq!(rig.controller.request_boost(true), BoostOutcome::Changed);

        rig.controller.account_io(true, 40 * MIB);
        let now = Instant::now();
        assert_eq!(
            rig.controller.request_boost_at(true, now),
            BoostOutcome::Unchanged
        );
        assert_eq!(rig.controller.snapshot(now).write_pages, 0);
        assert!(rig.controller.notifier().wait_idle(WAIT));
        assert_eq!(rig.controller.notifier_stats().deliveries, 1);
    }

    #[test]
    fn relax_when_idle_keeps_window() {
        let rig = rig();
        rig.controller.account_io(false, 8 * MIB);
        assert_eq!(rig.controller.request_boost(false), BoostOutcome::Unchanged);
        assert_eq!(rig.controller.snapshot(Instant::now()).read_pages, 2_048);
        assert_eq!(rig.telemetry.window_checks(), 0);
    }

    #[test]
    fn relax_is_never_gated_by_threshold() {
        let rig = rig();
        rig.controller.account_io(true, 64 * MIB);
        rig.controller.request_boost(true);
        rig.controller.account_io(true, 4 * MIB);

        assert_eq!(rig.controller.request_boost(false), BoostOutcome::Changed);
        assert!(!rig.controller.is_boosted());
        assert_eq!(rig.controller.snapshot(Instant::now()).write_pages, 0);
        assert_eq!(rig.telemetry.window_checks(), 1);
    }

    #[test]
    fn check_elapsed_waits_for_full_window() {
        let rig = rig();
        rig.controller.account_io(true, 40 * MIB);
        let start = Instant::now();
        // Window opened before `start`, so a width from `start` is always past it.
        assert_eq!(
            rig.controller
                .check_elapsed(start + Duration::from_millis(101)),
            Some(BoostOutcome::Changed)
        );
        assert_eq!(
            rig.controller.check_elapsed(start + Duration::from_millis(150)),
            None
        );
    }

    #[test]
    fn disabled_controller_ignores_requests() {
        let rig = rig();
        rig.controller.set_enabled(false);
        rig.controller.account_io(true, 40 * MIB);

        assert_eq!(rig.controller.request_boost(true), BoostOutcome::Unchanged);
        assert_eq!(
            rig.controller
                .check_elapsed(Instant::now() + Duration::from_secs(1)),
            Some(BoostOutcome::Unchanged)
        );
        assert!(!rig.controller.is_boosted());
        // Accounting continues; only transitions are gated.
        assert_eq!(rig.controller.snapshot(Instant::now()).write_pages, 10_240);
    }

    #[test]
    fn disabling_relaxes_active_boost() {
        let rig = rig();
        rig.controller.account_io(true, 40 * MIB);
        rig.controller.request_boost(true);
        rig.controller.set_enabled(false);

        assert!(!rig.controller.is_boosted());
        assert!(!rig.controller.is_enabled());
        assert!(rig.controller.notifier().wait_idle(WAIT));
        assert!(!rig.controller.notifier().published());

        rig.controller.set_enabled(true);
        assert!(rig.controller.is_enabled());
        assert!(!rig.controller.is_boosted());
    }

    #[test]
    fn disable_restarts_window_at_given_instant() {
        let rig = rig();
        rig.controller.account_io(true, 40 * MIB);
        let start = Instant::now();
        assert_eq!(
            rig.controller.check_elapsed(start + Duration::from_millis(150)),
            Some(BoostOutcome::Changed)
        );

        let relax_at = start + Duration::from_millis(160);
        rig.controller.set_enabled_at(false, relax_at);
        assert!(!rig.controller.is_boosted());
        assert_eq!(rig.controller.snapshot(relax_at).window_age, Duration::ZERO);

        rig.controller
            .set_enabled_at(true, start + Duration::from_millis(170));
        rig.controller.account_io(true, 40 * MIB);
        assert_eq!(
            rig.controller.check_elapsed(start + Duration::from_millis(170)),
            None
        );
        assert_eq!(
            rig.controller.check_elapsed(start + Duration::from_millis(260)),
            Some(BoostOutcome::Changed)
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.window.page_shift = 40;
        let (announcer, _rx) = ChannelAnnouncer::bounded(1);
        let err = BoostController::new(
            &config,
            Arc::new(SampledTelemetry::new()),
            Arc::new(announcer),
            None,
        )
        .unwrap_err();
        assert_eq!(err.code(), "SIB-1001");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn sub_threshold_traffic_never_boosts(
            sizes in proptest::collection::vec((any::<bool>(), 0u32..(8 * MIB)), 0..3)
        ) {
            let rig = rig();
            for (is_write, size) in sizes {
                rig.controller.account_io(is_write, size);
            }
            // At most 2 samples of < 8 MiB each stay under 32 MiB per direction.
            prop_assert_eq!(rig.controller.request_boost(true), BoostOutcome::ThresholdNotMet);
            prop_assert!(!rig.controller.is_boosted());
        }

        #[test]
        fn boost_attempts_always_reset_window(
            on in any::<bool>(),
            preboost in any::<bool>(),
            write_mib in 0u32..64,
            offset_ms in 0u64..500,
        ) {
            let rig = rig();
            if preboost {
                rig.controller.account_io(true, 64 * MIB);
                rig.controller.request_boost(true);
            }
            rig.controller.account_io(true, write_mib * MIB);
            let now = Instant::now() + Duration::from_millis(offset_ms);
            let outcome = rig.controller.request_boost_at(on, now);

            if on || outcome == BoostOutcome::Changed {
                let snap = rig.controller.snapshot(now);
                prop_assert_eq!(snap.write_pages, 0);
                prop_assert_eq!(snap.window_age, Duration::ZERO);
            } else {
                prop_assert_eq!(rig.controller.snapshot(now).write_pages, u64::from(write_mib) * 256);
            }
        }
    }
}
