//! SIB-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::boost::announce::AnnounceError;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, SibError>;

/// Top-level error type for the storage I/O booster.
#[derive(Debug, Error)]
pub enum SibError {
    #[error("[SIB-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[SIB-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[SIB-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[SIB-2001] invalid control command: {}", describe_command_byte(.byte))]
    InvalidCommand { byte: Option<u8> },

    #[error("[SIB-2002] announcement via {announcer} failed: {details}")]
    AnnounceFailure {
        announcer: &'static str,
        details: String,
    },

    #[error("[SIB-2003] telemetry unavailable for {target}: {details}")]
    TelemetryUnavailable { target: String, details: String },

    #[error("[SIB-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[SIB-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[SIB-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[SIB-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl SibError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "SIB-1001",
            Self::MissingConfig { .. } => "SIB-1002",
            Self::ConfigParse { .. } => "SIB-1003",
            Self::InvalidCommand { .. } => "SIB-2001",
            Self::AnnounceFailure { .. } => "SIB-2002",
            Self::TelemetryUnavailable { .. } => "SIB-2003",
            Self::Serialization { .. } => "SIB-2101",
            Self::Io { .. } => "SIB-3002",
            Self::ChannelClosed { .. } => "SIB-3003",
            Self::Runtime { .. } => "SIB-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AnnounceFailure { .. }
                | Self::TelemetryUnavailable { .. }
                | Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

#[allow(clippy::ref_option)]
fn describe_command_byte(byte: &Option<u8>) -> String {
    match *byte {
        Some(b) if b.is_ascii_graphic() => format!("{:?} (0x{b:02x})", char::from(b)),
        Some(b) => format!("0x{b:02x}"),
        None => "empty input".to_string(),
    }
}

impl From<AnnounceError> for SibError {
    fn from(value: AnnounceError) -> Self {
        Self::AnnounceFailure {
            announcer: value.announcer(),
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for SibError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for SibError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
