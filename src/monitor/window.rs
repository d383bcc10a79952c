//! Sliding traffic window: page-granular read/write accounting and the boost threshold.

#![allow(missing_docs)]

use std::time::{Duration, Instant};

use crate::core::config::WindowConfig;

/// Per-direction page volume that justifies a boost within one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoostThreshold {
    pages: u64,
}

impl BoostThreshold {
    #[must_use]
    pub const fn from_pages(pages: u64) -> Self {
        Self { pages }
    }

    #[must_use]
    pub fn from_config(config: &WindowConfig) -> Self {
        Self::from_pages(config.threshold_pages())
    }

    #[must_use]
    pub const fn pages(self) -> u64 {
        self.pages
    }

    /// Either direction alone reaching the threshold is enough.
    #[must_use]
    pub const fn is_met(self, read_pages: u64, write_pages: u64) -> bool {
        read_pages >= self.pages || write_pages >= self.pages
    }
}

/// Read/write page counters for the current sampling window.
///
/// Counters only grow within a window. They return to zero exclusively through
/// [`WindowAccumulator::reset`], which also moves `window_start` to the reset time.
#[derive(Debug, Clone)]
pub struct WindowAccumulator {
    window_start: Instant,
    read_pages: u64,
    write_pages: u64,
    page_shift: u32,
    threshold: BoostThreshold,
}

impl WindowAccumulator {
    #[must_use]
    pub fn new(now: Instant, page_shift: u32, threshold: BoostThreshold) -> Self {
        Self {
            window_start: now,
            read_pages: 0,
            write_pages: 0,
            page_shift,
            threshold,
        }
    }

    #[must_use]
    pub fn from_config(now: Instant, config: &WindowConfig) -> Self {
        Self::new(now, config.page_shift, BoostThreshold::from_config(config))
    }

    /// Account one request of `size_bytes` in the given direction.
    ///
    /// Sub-page remainders are dropped; counters saturate rather than wrap. A
    /// page shift of 32 or more counts every request as zero pages.
    pub fn update(&mut self, is_write: bool, size_bytes: u32) {
        let pages = u64::from(size_bytes.checked_shr(self.page_shift).unwrap_or(0));
        if is_write {
            self.write_pages = self.write_pages.saturating_add(pages);
        } else {
            self.read_pages = self.read_pages.saturating_add(pages);
        }
    }

    /// Start a fresh window at `now`.
    pub fn reset(&mut self, now: Instant) {
        self.window_start = now;
        self.read_pages = 0;
        self.write_pages = 0;
    }

    #[must_use]
    pub fn exceeds_threshold(&self) -> bool {
        self.threshold.is_met(self.read_pages, self.write_pages)
    }

    /// Time since the window opened. A `now` earlier than the window start yields zero.
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.window_start)
    }

    #[must_use]
    pub const fn window_start(&self) -> Instant {
        self.window_start
    }

    #[must_use]
    pub const fn read_pages(&self) -> u64 {
        self.read_pages
    }

    #[must_use]
    pub const fn write_pages(&self) -> u64 {
        self.write_pages
    }

    #[must_use]
    pub const fn threshold(&self) -> BoostThreshold {
        self.threshold
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.read_pages == 0 && self.write_pages == 0
    }
}
