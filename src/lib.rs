#![forbid(unsafe_code)]

//! Storage I/O booster (sib): watches block-I/O traffic on one storage target
//! and tells an external performance governor when sustained load justifies
//! a boost.
//!
//! Data flow:
//! 1. **Window**: completed requests are accounted in pages per direction
//! 2. **Controller**: each elapsed window is evaluated against the threshold
//! 3. **Notifier**: boost changes are announced asynchronously until the
//!    listener has seen the latest state
//!
//! # Library usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storage_io_booster::prelude::*;
//!
//! # fn main() -> storage_io_booster::core::errors::Result<()> {
//! let config = Config::load(None)?;
//! let (announcer, _events) = ChannelAnnouncer::bounded(16);
//! let controller = Arc::new(BoostController::new(
//!     &config,
//!     Arc::new(SampledTelemetry::new()),
//!     Arc::new(announcer),
//!     None,
//! )?);
//! controller.account_io(true, 1 << 20);
//! let surface = ControlSurface::new(Arc::clone(&controller));
//! surface.handle_command(b"1")?;
//! # Ok(())
//! # }
//! ```

pub mod prelude;

pub mod boost;
pub mod control;
pub mod core;
pub mod daemon;
pub mod logger;
pub mod monitor;
