//! Periodic window check driver for hosts without a per-I/O check site.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, select};

use crate::boost::controller::{BoostController, BoostOutcome};
use crate::core::errors::{Result, SibError};

/// A boost switched on by a tick, with the window it was decided on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickBoost {
    pub at: Instant,
    pub read_pages: u64,
    pub write_pages: u64,
}

/// Calls [`BoostController::check_elapsed`] once per interval on a dedicated thread.
#[derive(Debug)]
pub struct WindowTicker {
    shutdown_tx: Option<Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
    boosts: Arc<AtomicU64>,
}

impl WindowTicker {
    pub fn spawn(controller: Arc<BoostController>, interval: Duration) -> Result<Self> {
        Self::start(controller, interval, None)
    }

    /// Like [`WindowTicker::spawn`], also sending a [`TickBoost`] for every boost a
    /// tick triggers. Reports that do not fit in `reports` are dropped.
    pub fn spawn_reporting(
        controller: Arc<BoostController>,
        interval: Duration,
        reports: Sender<TickBoost>,
    ) -> Result<Self> {
        Self::start(controller, interval, Some(reports))
    }

    fn start(
        controller: Arc<BoostController>,
        interval: Duration,
        reports: Option<Sender<TickBoost>>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let ticks = Arc::new(AtomicU64::new(0));
        let boosts = Arc::new(AtomicU64::new(0));
        let thread_ticks = Arc::clone(&ticks);
        let thread_boosts = Arc::clone(&boosts);

        let join = thread::Builder::new()
            .name("sib-ticker".to_string())
            .spawn(move || {
                ticker_thread_main(
                    &controller,
                    interval,
                    &shutdown_rx,
                    reports.as_ref(),
                    &thread_ticks,
                    &thread_boosts,
                );
            })
            .map_err(|source| SibError::Runtime {
                details: format!("failed to spawn ticker thread: {source}"),
            })?;

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            join: Some(join),
            ticks,
            boosts,
        })
    }

    /// Completed ticks so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Ticks whose window check switched boost on.
    #[must_use]
    pub fn boosts(&self) -> u64 {
        self.boosts.load(Ordering::Relaxed)
    }

    /// Stop the thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        drop(self.shutdown_tx.take());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for WindowTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ticker_thread_main(
    controller: &BoostController,
    interval: Duration,
    shutdown_rx: &Receiver<()>,
    reports: Option<&Sender<TickBoost>>,
    ticks: &AtomicU64,
    boosts: &AtomicU64,
) {
    loop {
        select! {
            recv(shutdown_rx) -> _ => break,
            default(interval) => {
                let now = Instant::now();
                let window = reports.map(|_| controller.snapshot(now));
                if controller.check_elapsed(now) == Some(BoostOutcome::Changed) {
                    boosts.fetch_add(1, Ordering::Relaxed);
                    if let (Some(tx), Some(window)) = (reports, window) {
                        let _ = tx.try_send(TickBoost {
                            at: now,
                            read_pages: window.read_pages,
                            write_pages: window.write_pages,
                        });
                    }
                }
                ticks.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
