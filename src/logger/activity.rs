//! Activity logger: a dedicated thread owns the JSONL writer; everyone else sends
//! [`ActivityEvent`]s through a bounded crossbeam channel.
//!
//! `send()` never blocks. When the channel is full the event is dropped and
//! counted, and the logger thread reports the drop count with its next write.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{Result, SibError};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

/// Default bounded channel capacity for log events.
const CHANNEL_CAPACITY: usize = 256;

/// Events the controller, notifier, and control surface record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityEvent {
    ControllerStarted {
        target: String,
        enabled: bool,
        config_hash: Option<String>,
    },
    ControllerStopped {
        target: String,
        reason: String,
    },
    EnabledChanged {
        target: String,
        enabled: bool,
    },
    BoostChanged {
        target: String,
        boosted: bool,
        read_pages: u64,
        write_pages: u64,
    },
    AnnounceDelivered {
        boost: bool,
        attempts: u64,
    },
    AnnounceFailed {
        boost: bool,
        code: String,
        message: String,
    },
    InvalidCommand {
        byte: Option<u8>,
    },
    TelemetryEnabled {
        target: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Sentinel asking the logger thread to flush and exit.
    Shutdown,
}

/// Cheaply-cloneable handle for sending log events.
#[derive(Debug, Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Send an event to the logger thread. Non-blocking.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown.
    }

    /// Number of events dropped due to channel back-pressure and not yet reported.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit. Blocks only until the sentinel is queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

/// Options for the activity logger.
#[derive(Debug, Clone)]
pub struct ActivityLoggerConfig {
    pub jsonl: JsonlConfig,
    pub channel_capacity: usize,
}

impl ActivityLoggerConfig {
    #[must_use]
    pub fn new(jsonl: JsonlConfig) -> Self {
        Self {
            jsonl,
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread and return a handle plus its join handle.
///
/// The thread runs until `handle.shutdown()` is called or every handle is dropped.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: Arc::clone(&dropped),
    };

    let join = thread::Builder::new()
        .name("sib-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config.jsonl, &dropped))
        .map_err(|e| SibError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<ActivityEvent>, jsonl_config: JsonlConfig, dropped: &AtomicU64) {
    let mut jsonl = JsonlWriter::open(jsonl_config);

    while let Ok(event) = rx.recv() {
        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{d} log events dropped due to back-pressure"));
            jsonl.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        if let Some(entry) = event_to_log_entry(&event) {
            jsonl.write_entry(&entry);
        }
    }

    jsonl.flush();
    jsonl.fsync();
}

fn event_to_log_entry(event: &ActivityEvent) -> Option<LogEntry> {
    let entry = match event {
        ActivityEvent::ControllerStarted {
            target,
            enabled,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::ControllerStart, Severity::Info);
            e.target = Some(target.clone());
            e.enabled = Some(*enabled);
            e.details = config_hash.as_ref().map(|h| format!("config_hash={h}"));
            e
        }
        ActivityEvent::ControllerStopped { target, reason } => {
            let mut e = LogEntry::new(EventType::ControllerStop, Severity::Info);
            e.target = Some(target.clone());
            e.details = Some(reason.clone());
            e
        }
        ActivityEvent::EnabledChanged { target, enabled } => {
            let mut e = LogEntry::new(EventType::EnableChange, Severity::Info);
            e.target = Some(target.clone());
            e.enabled = Some(*enabled);
            e
        }
        ActivityEvent::BoostChanged {
            target,
            boosted,
            read_pages,
            write_pages,
        } => {
            let mut e = LogEntry::new(EventType::BoostChange, Severity::Info);
            e.target = Some(target.clone());
            e.boost = Some(*boosted);
            e.read_pages = Some(*read_pages);
            e.write_pages = Some(*write_pages);
            e
        }
        ActivityEvent::AnnounceDelivered { boost, attempts } => {
            let mut e = LogEntry::new(EventType::AnnounceDelivered, Severity::Info);
            e.boost = Some(*boost);
            e.attempts = Some(*attempts);
            e.ok = Some(true);
            e
        }
        ActivityEvent::AnnounceFailed {
            boost,
            code,
            message,
        } => {
            let mut e = LogEntry::new(EventType::AnnounceFailed, Severity::Warning);
            e.boost = Some(*boost);
            e.ok = Some(false);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::InvalidCommand { byte } => {
            let mut e = LogEntry::new(EventType::InvalidCommand, Severity::Warning);
            e.ok = Some(false);
            e.details = Some(byte.map_or_else(|| "empty".to_string(), |b| format!("0x{b:02x}")));
            e
        }
        ActivityEvent::TelemetryEnabled { target } => {
            let mut e = LogEntry::new(EventType::TelemetryEnable, Severity::Info);
            e.target = Some(target.clone());
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.ok = Some(false);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::Shutdown => return None,
    };
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn logger_thread_writes_events_and_exits_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.jsonl");
        let mut jsonl = JsonlConfig::at(&path);
        jsonl.fallback_path = None;
        let (handle, join) = spawn_logger(ActivityLoggerConfig::new(jsonl)).unwrap();

        handle.send(ActivityEvent::BoostChanged {
            target: "ufs".to_string(),
            boosted: true,
            read_pages: 0,
            write_pages: 10_240,
        });
        handle.send(ActivityEvent::AnnounceDelivered {
            boost: true,
            attempts: 2,
        });
        handle.shutdown();
        join.join().unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "boost_change");
        assert_eq!(lines[0]["target"], "ufs");
        assert_eq!(lines[1]["event"], "announce_delivered");
        assert_eq!(lines[1]["attempts"], 2);
    }

    #[test]
    fn send_after_shutdown_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let mut jsonl = JsonlConfig::at(dir.path().join("late.jsonl"));
        jsonl.fallback_path = None;
        let (handle, join) = spawn_logger(ActivityLoggerConfig::new(jsonl)).unwrap();
        handle.shutdown();
        join.join().unwrap();

        handle.send(ActivityEvent::InvalidCommand { byte: Some(b'2') });
        assert_eq!(handle.dropped_events(), 0);
    }

    #[test]
    fn invalid_command_entry_records_byte() {
        let entry = event_to_log_entry(&ActivityEvent::InvalidCommand { byte: Some(b'2') })
            .expect("entry");
        assert_eq!(entry.event, EventType::InvalidCommand);
        assert_eq!(entry.details.as_deref(), Some("0x32"));
        assert!(event_to_log_entry(&ActivityEvent::Shutdown).is_none());
    }
}
