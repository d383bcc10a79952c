//! Convergence notifier: keeps the externally announced boost state in step with
//! the requested one.
//!
//! Requests are coalesced. The worker thread always announces the *latest*
//! requested value, so a burst of flips ends in at most one announcement per
//! distinct state the worker observes, and the final announcement always matches
//! the final request. A failed announcement is retried after a backoff pause
//! until it succeeds or the notifier shuts down.
//!
//! Lock order: callers may hold their own lock while calling [`ConvergenceNotifier::request`];
//! the notifier never calls back out while holding its internal lock.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, select};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::boost::announce::Announcer;
use crate::core::config::NotifierConfig;
use crate::core::errors::{Result, SibError};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};

/// Delivery counters since the notifier started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotifierStats {
    pub requested: bool,
    pub published: bool,
    pub deliveries: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct DeliveryState {
    requested: bool,
    published: bool,
    in_flight: bool,
    deliveries: u64,
    failures: u64,
}

impl DeliveryState {
    const fn is_idle(&self) -> bool {
        !self.in_flight && self.requested == self.published
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<DeliveryState>,
    idle: Condvar,
}

/// Background announcer for boost state changes.
pub struct ConvergenceNotifier {
    shared: Arc<Shared>,
    wake_tx: Sender<()>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<(thread::JoinHandle<()>, Receiver<()>)>>,
    shutdown_timeout: Duration,
    logger: Option<ActivityLoggerHandle>,
}

impl std::fmt::Debug for ConvergenceNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvergenceNotifier")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

struct Worker {
    shared: Arc<Shared>,
    announcer: Arc<dyn Announcer>,
    logger: Option<ActivityLoggerHandle>,
    retry_backoff: Duration,
}

impl ConvergenceNotifier {
    /// Start the worker thread. Both requested and published states begin as "not boosted".
    pub fn spawn(
        config: &NotifierConfig,
        announcer: Arc<dyn Announcer>,
        logger: Option<ActivityLoggerHandle>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        // Capacity 1: a pending wake-up already covers every later request.
        let (wake_tx, wake_rx) = bounded::<()>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(0);

        let worker = Worker {
            shared: Arc::clone(&shared),
            announcer,
            logger: logger.clone(),
            retry_backoff: config.retry_backoff(),
        };
        let join = thread::Builder::new()
            .name("sib-notifier".to_string())
            .spawn(move || {
                worker.run(&wake_rx, &shutdown_rx);
                drop(done_tx);
            })
            .map_err(|source| SibError::Runtime {
                details: format!("failed to spawn notifier thread: {source}"),
            })?;

        Ok(Self {
            shared,
            wake_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some((join, done_rx))),
            shutdown_timeout: config.shutdown_timeout(),
            logger,
        })
    }

    /// Record the desired boost state and wake the worker. Never blocks on delivery.
    ///
    /// Once the worker has exited the request is only recorded; it is reported as
    /// `SibError::ChannelClosed` on stderr and in the activity log.
    pub fn request(&self, boost: bool) {
        let needs_wake = {
            let mut state = self.shared.state.lock();
            state.requested = boost;
            state.requested != state.published
        };
        if !needs_wake {
            return;
        }
        // Full means a wake-up is already pending.
        if let Err(TrySendError::Disconnected(())) = self.wake_tx.try_send(()) {
            let err = SibError::ChannelClosed {
                component: "notifier",
            };
            eprintln!("[SIB-NOTIFY] {err}; boost={} not announced", u8::from(boost));
            if let Some(logger) = &self.logger {
                logger.send(ActivityEvent::Error {
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
            }
        }
    }

    #[must_use]
    pub fn requested(&self) -> bool {
        self.shared.state.lock().requested
    }

    /// Last state successfully announced.
    #[must_use]
    pub fn published(&self) -> bool {
        self.shared.state.lock().published
    }

    /// True when nothing is in flight and the published state matches the request.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.shared.state.lock().is_idle()
    }

    /// Block until idle or until `timeout` elapses. Returns whether idle was reached.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.is_idle() {
            if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                return state.is_idle();
            }
        }
        true
    }

    #[must_use]
    pub fn stats(&self) -> NotifierStats {
        let state = self.shared.state.lock();
        NotifierStats {
            requested: state.requested,
            published: state.published,
            deliveries: state.deliveries,
            failures: state.failures,
        }
    }

    /// Stop the worker. Waits up to the configured shutdown timeout, then detaches it.
    ///
    /// Pending requests that were not yet announced are abandoned. Idempotent.
    pub fn shutdown(&self) {
        drop(self.shutdown_tx.lock().take());
        let Some((join, done_rx)) = self.worker.lock().take() else {
            return;
        };
        match done_rx.recv_timeout(self.shutdown_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                eprintln!(
                    "[SIB-NOTIFY] worker did not stop within {:?}; detaching",
                    self.shutdown_timeout
                );
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = join.join();
            }
        }
    }
}

impl Drop for ConvergenceNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Worker {
    fn run(&self, wake_rx: &Receiver<()>, shutdown_rx: &Receiver<()>) {
        loop {
            select! {
                recv(wake_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                }
                recv(shutdown_rx) -> _ => break,
            }
            if !self.converge(shutdown_rx) {
                break;
            }
        }
        self.mark_stopped();
    }

    /// Announce until published matches requested. Returns false when shutdown
    /// was signalled during a backoff pause.
    fn converge(&self, shutdown_rx: &Receiver<()>) -> bool {
        let mut attempts: u64 = 0;
        loop {
            let target = {
                let mut state = self.shared.state.lock();
                if state.requested == state.published {
                    state.in_flight = false;
                    self.shared.idle.notify_all();
                    return true;
                }
                state.in_flight = true;
                state.requested
            };

            attempts += 1;
            // Announce outside the lock; requests may change `requested` meanwhile.
            match self.announcer.announce(target) {
                Ok(()) => {
                    {
                        let mut state = self.shared.state.lock();
                        state.published = target;
                        state.deliveries += 1;
                    }
                    if let Some(logger) = &self.logger {
                        logger.send(ActivityEvent::AnnounceDelivered {
                            boost: target,
                            attempts,
                        });
                    }
                    attempts = 0;
                }
                Err(err) => {
                    self.shared.state.lock().failures += 1;
                    if attempts == 1 {
                        let err = SibError::from(err);
                        eprintln!("[SIB-NOTIFY] {err}; retrying");
                        if let Some(logger) = &self.logger {
                            logger.send(ActivityEvent::AnnounceFailed {
                                boost: target,
                                code: err.code().to_string(),
                                message: err.to_string(),
                            });
                        }
                    }
                    match shutdown_rx.recv_timeout(self.retry_backoff) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return false,
                    }
                }
            }
        }
    }

    fn mark_stopped(&self) {
        self.shared.state.lock().in_flight = false;
        self.shared.idle.notify_all();
    }
}
