//! JSONL activity log: one self-contained JSON object per line.
//!
//! Lines are assembled in memory and written with a single `write_all` so a
//! tailing reader never sees a partial record.
//!
//! Degradation chain when the log cannot be written:
//! 1. Primary file path
//! 2. Fallback path (e.g. `/dev/shm/sib.jsonl`)
//! 3. stderr with `[SIB-JSONL]` prefix
//! 4. Silent discard (logging must never take the controller down)

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SibError};

/// Severity level for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Activity event kinds written to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ControllerStart,
    ControllerStop,
    EnableChange,
    BoostChange,
    AnnounceDelivered,
    AnnounceFailed,
    InvalidCommand,
    TelemetryEnable,
    Error,
}

/// A single JSONL record. Only `ts`, `event`, and `severity` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp with millisecond precision.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    /// Monitored storage target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boost: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Window read pages at the time of the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_pages: Option<u64>,
    /// Window write pages at the time of the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_pages: Option<u64>,
    /// Announcement attempts spent in one convergence pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Create a new entry stamped with the current UTC time.
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            target: None,
            boost: None,
            enabled: None,
            read_pages: None,
            write_pages: None,
            attempts: None,
            ok: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Normal,
    Fallback,
    Stderr,
    Discard,
}

/// Configuration for the JSONL writer.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would exceed this size.
    pub max_size_bytes: u64,
    /// Rotated generations kept as `<path>.1` .. `<path>.N`.
    pub max_rotated_files: u32,
    pub fsync_interval: Duration,
}

impl JsonlConfig {
    /// Config for `path` with the default fallback and rotation policy.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/sib/activity.jsonl"),
            fallback_path: Some(PathBuf::from("/dev/shm/sib.jsonl")),
            max_size_bytes: 16 * 1024 * 1024,
            max_rotated_files: 3,
            fsync_interval: Duration::from_secs(10),
        }
    }
}

/// Append-only JSONL writer with size rotation and the degradation chain above.
pub struct JsonlWriter {
    config: JsonlConfig,
    writer: Option<BufWriter<File>>,
    state: WriterState,
    bytes_written: u64,
    last_fsync: Instant,
}

impl JsonlWriter {
    /// Open the log, falling through the degradation chain on failure.
    pub fn open(config: JsonlConfig) -> Self {
        let mut w = Self {
            config,
            writer: None,
            state: WriterState::Discard,
            bytes_written: 0,
            last_fsync: Instant::now(),
        };
        w.open_primary();
        w
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(json) => self.write_line(&format!("{json}\n")),
            Err(e) => {
                let _ = writeln!(io::stderr(), "[SIB-JSONL] serialize error: {e}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }

    pub fn fsync(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
            let _ = w.get_ref().sync_data();
        }
        self.last_fsync = Instant::now();
    }

    /// Current degradation state label.
    pub fn state(&self) -> &'static str {
        match self.state {
            WriterState::Normal => "normal",
            WriterState::Fallback => "fallback",
            WriterState::Stderr => "stderr",
            WriterState::Discard => "discard",
        }
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if matches!(self.state, WriterState::Normal | WriterState::Fallback)
            && self.bytes_written + len > self.config.max_size_bytes
        {
            self.rotate();
        }

        match self.state {
            WriterState::Normal | WriterState::Fallback => {
                let written = self
                    .writer
                    .as_mut()
                    .is_some_and(|w| w.write_all(line.as_bytes()).is_ok());
                if written {
                    self.bytes_written += len;
                    if self.last_fsync.elapsed() >= self.config.fsync_interval {
                        self.fsync();
                    }
                } else {
                    self.degrade();
                    self.write_line(line);
                }
            }
            WriterState::Stderr => {
                let _ = write!(io::stderr(), "[SIB-JSONL] {line}");
            }
            WriterState::Discard => {}
        }
    }

    fn open_primary(&mut self) {
        if let Ok((file, size)) = open_append(&self.config.path) {
            self.attach(file, size, WriterState::Normal);
        } else {
            self.open_fallback();
        }
    }

    fn open_fallback(&mut self) {
        let opened = self
            .config
            .fallback_path
            .as_deref()
            .map(|fb| (fb.to_path_buf(), open_append(fb)));
        match opened {
            Some((fb, Ok((file, size)))) => {
                let _ = writeln!(
                    io::stderr(),
                    "[SIB-JSONL] primary path failed, using fallback: {}",
                    fb.display()
                );
                self.attach(file, size, WriterState::Fallback);
            }
            _ => {
                let _ = writeln!(io::stderr(), "[SIB-JSONL] log paths unavailable, using stderr");
                self.writer = None;
                self.state = WriterState::Stderr;
            }
        }
    }

    fn attach(&mut self, file: File, size: u64, state: WriterState) {
        self.writer = Some(BufWriter::with_capacity(16 * 1024, file));
        self.bytes_written = size;
        self.state = state;
    }

    fn degrade(&mut self) {
        self.writer = None;
        match self.state {
            WriterState::Normal => self.open_fallback(),
            WriterState::Fallback => self.state = WriterState::Stderr,
            WriterState::Stderr | WriterState::Discard => self.state = WriterState::Discard,
        }
    }

    fn rotate(&mut self) {
        self.flush();
        self.writer = None;

        let base = match self.state {
            WriterState::Normal => self.config.path.clone(),
            WriterState::Fallback => match &self.config.fallback_path {
                Some(p) => p.clone(),
                None => return,
            },
            WriterState::Stderr | WriterState::Discard => return,
        };

        // <base>.N-1 → <base>.N, …, <base> → <base>.1; the oldest generation falls off.
        let _ = fs::remove_file(rotated_name(&base, self.config.max_rotated_files));
        for i in (1..self.config.max_rotated_files).rev() {
            let _ = fs::rename(rotated_name(&base, i), rotated_name(&base, i + 1));
        }
        if self.config.max_rotated_files > 0 {
            let _ = fs::rename(&base, rotated_name(&base, 1));
        } else {
            let _ = fs::remove_file(&base);
        }

        match open_append(&base) {
            Ok((file, size)) => {
                let state = self.state;
                self.attach(file, size, state);
            }
            Err(_) => self.degrade(),
        }
    }
}

fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| SibError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| SibError::io(path, source))?;
    let size = file.metadata().map_or(0, |m| m.len());
    Ok((file, size))
}

fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
