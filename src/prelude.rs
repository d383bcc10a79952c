//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use storage_io_booster::prelude::*;
//! ```

// Core
pub use crate::core::config::{Config, PAGE_SHIFT, THRESHOLD_PAGES, WINDOW_WIDTH};
pub use crate::core::errors::{Result, SibError};

// Monitor
pub use crate::monitor::telemetry::{
    MonitoredTargetId, SampledTelemetry, TelemetryData, TelemetrySource,
};
pub use crate::monitor::window::{BoostThreshold, WindowAccumulator};

// Boost
pub use crate::boost::announce::{
    AnnounceError, Announcer, BoostEvent, ChannelAnnouncer, CommandAnnouncer,
};
pub use crate::boost::controller::{BoostController, BoostOutcome, ControllerSnapshot};
pub use crate::boost::notifier::{ConvergenceNotifier, NotifierStats};

// Control
pub use crate::control::surface::{ControlSurface, IoStatSnapshot};

// Daemon
pub use crate::daemon::ticker::{TickBoost, WindowTicker};

// Logging
pub use crate::logger::activity::{
    ActivityEvent, ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger,
};
pub use crate::logger::jsonl::JsonlConfig;
