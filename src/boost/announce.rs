//! External listener seam: who hears about boost state changes, and how they fail.
//!
//! Announcers report failure instead of retrying. Retrying is the convergence
//! notifier's job, and it always retries with the latest requested state.

#![allow(missing_docs)]

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to deliver one announcement.
#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("{announcer}: listener disconnected")]
    Disconnected { announcer: &'static str },

    #[error("{announcer}: listener backlog full")]
    Backlogged { announcer: &'static str },

    #[error("{announcer}: failed to start hook {program}: {source}")]
    Spawn {
        announcer: &'static str,
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{announcer}: hook {program} exited with {status}")]
    HookStatus {
        announcer: &'static str,
        program: PathBuf,
        status: String,
    },
}

impl AnnounceError {
    /// Name of the announcer that produced the failure.
    #[must_use]
    pub const fn announcer(&self) -> &'static str {
        match self {
            Self::Disconnected { announcer }
            | Self::Backlogged { announcer }
            | Self::Spawn { announcer, .. }
            | Self::HookStatus { announcer, .. } => announcer,
        }
    }
}

/// Payload of one announcement. Renders as `boost=0` / `boost=1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoostEvent {
    pub boost: bool,
}

impl BoostEvent {
    #[must_use]
    pub const fn new(boost: bool) -> Self {
        Self { boost }
    }

    /// `"0"` or `"1"`.
    #[must_use]
    pub const fn flag(self) -> &'static str {
        if self.boost { "1" } else { "0" }
    }
}

impl fmt::Display for BoostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "boost={}", self.flag())
    }
}

/// Receives boost state announcements.
///
/// Implementations must bound their own latency: the notifier calls
/// `announce` from its worker thread and waits for the result.
pub trait Announcer: Send + Sync {
    fn name(&self) -> &'static str;
    fn announce(&self, boost: bool) -> Result<(), AnnounceError>;
}

// ──── Channel (in-process listener) ────

/// Forwards announcements into a bounded crossbeam channel.
///
/// A full channel or a dropped receiver is reported as a failed announcement.
#[derive(Debug, Clone)]
pub struct ChannelAnnouncer {
    tx: Sender<BoostEvent>,
}

impl ChannelAnnouncer {
    #[must_use]
    pub fn new(tx: Sender<BoostEvent>) -> Self {
        Self { tx }
    }

    /// Create an announcer and the receiving end of its channel.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, Receiver<BoostEvent>) {
        let (tx, rx) = bounded(capacity);
        (Self::new(tx), rx)
    }
}

impl Announcer for ChannelAnnouncer {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn announce(&self, boost: bool) -> Result<(), AnnounceError> {
        self.tx
            .try_send(BoostEvent::new(boost))
            .map_err(|err| match err {
                TrySendError::Full(_) => AnnounceError::Backlogged {
                    announcer: self.name(),
                },
                TrySendError::Disconnected(_) => AnnounceError::Disconnected {
                    announcer: self.name(),
                },
            })
    }
}

// ──── Command hook ────

/// Runs an external program for every announcement.
///
/// The program receives `BOOST=0|1` in its environment and `boost=0|1` as its
/// last argument. A non-zero exit status counts as a failed announcement.
#[derive(Debug, Clone)]
pub struct CommandAnnouncer {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandAnnouncer {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Fixed arguments passed before the `boost=` argument.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Announcer for CommandAnnouncer {
    fn name(&self) -> &'static str {
        "hook"
    }

    fn announce(&self, boost: bool) -> Result<(), AnnounceError> {
        let event = BoostEvent::new(boost);
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(event.to_string())
            .env("BOOST", event.flag())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| AnnounceError::Spawn {
                announcer: self.name(),
                program: self.program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(AnnounceError::HookStatus {
                announcer: self.name(),
                program: self.program.clone(),
                status: status.to_string(),
            })
        }
    }
}
