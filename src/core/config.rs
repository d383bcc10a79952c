//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SibError};

/// Page-size exponent used to convert byte counts to pages (4 KiB pages).
pub const PAGE_SHIFT: u32 = 12;

const WINDOW_WIDTH_MS: u64 = 100;

/// Default width of one sampling window.
pub const WINDOW_WIDTH: Duration = Duration::from_millis(WINDOW_WIDTH_MS);

/// Default per-direction traffic volume that justifies a boost (32 MiB).
pub const THRESHOLD_BYTES: u64 = 32 * 1024 * 1024;

/// [`THRESHOLD_BYTES`] expressed in pages.
pub const THRESHOLD_PAGES: u64 = THRESHOLD_BYTES >> PAGE_SHIFT;

/// Full booster configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub notifier: NotifierConfig,
    pub control: ControlConfig,
    pub announce: AnnounceConfig,
    pub paths: PathsConfig,
}

/// Sampling window geometry and boost threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WindowConfig {
    /// Window width; a periodic check re-evaluates traffic once this elapses.
    pub width_ms: u64,
    /// Read or write volume within one window that triggers a boost.
    pub threshold_bytes: u64,
    /// Page-size exponent applied to every accounted request size.
    pub page_shift: u32,
}

/// Convergence notifier pacing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifierConfig {
    /// Pause after a failed announcement before the next convergence pass.
    pub retry_backoff_ms: u64,
    /// How long `shutdown` waits for the worker thread to exit.
    pub shutdown_timeout_ms: u64,
}

/// Administrative defaults for the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControlConfig {
    /// Whether boosting is permitted right after initialization.
    pub start_enabled: bool,
    /// Label of the monitored storage target (e.g. "ufs", "mmc").
    pub target: String,
    /// Ticker period for the periodic window check (`sib replay --realtime`);
    /// 0 means "window width".
    pub tick_interval_ms: u64,
}

/// External listener wiring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AnnounceConfig {
    /// Program invoked for each announcement with `BOOST=0|1` in its environment.
    pub hook_command: Option<PathBuf>,
}

/// Filesystem paths used by sib.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub activity_log: PathBuf,
}

impl WindowConfig {
    #[must_use]
    pub fn width(&self) -> Duration {
        Duration::from_millis(self.width_ms)
    }

    #[must_use]
    pub fn threshold_pages(&self) -> u64 {
        self.threshold_bytes.checked_shr(self.page_shift).unwrap_or(0)
    }
}

impl NotifierConfig {
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width_ms: WINDOW_WIDTH_MS,
            threshold_bytes: THRESHOLD_BYTES,
            page_shift: PAGE_SHIFT,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: 20,
            shutdown_timeout_ms: 1_000,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            start_enabled: true,
            target: "ufs".to_string(),
            tick_interval_ms: 0,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[SIB-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        Self {
            config_file: home_dir.join(".config").join("sib").join("config.toml"),
            activity_log: home_dir
                .join(".local")
                .join("share")
                .join("sib")
                .join("activity.jsonl"),
        }
    }
}

impl ControlConfig {
    /// Effective ticker period: falls back to the window width when unset.
    #[must_use]
    pub fn tick_interval(&self, window: &WindowConfig) -> Duration {
        if self.tick_interval_ms == 0 {
            window.width()
        } else {
            Duration::from_millis(self.tick_interval_ms)
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| SibError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(SibError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // window
        set_u64(&mut lookup, "SIB_WINDOW_WIDTH_MS", &mut self.window.width_ms)?;
        set_u64(
            &mut lookup,
            "SIB_WINDOW_THRESHOLD_BYTES",
            &mut self.window.threshold_bytes,
        )?;
        if let Some(raw) = lookup("SIB_WINDOW_PAGE_SHIFT") {
            self.window.page_shift = raw.parse::<u32>().map_err(|error| SibError::ConfigParse {
                context: "env",
                details: format!("SIB_WINDOW_PAGE_SHIFT={raw:?}: {error}"),
            })?;
        }

        // notifier
        set_u64(
            &mut lookup,
            "SIB_NOTIFIER_RETRY_BACKOFF_MS",
            &mut self.notifier.retry_backoff_ms,
        )?;
        set_u64(
            &mut lookup,
            "SIB_NOTIFIER_SHUTDOWN_TIMEOUT_MS",
            &mut self.notifier.shutdown_timeout_ms,
        )?;

        // control
        if let Some(raw) = lookup("SIB_CONTROL_START_ENABLED") {
            self.control.start_enabled = parse_env_bool("SIB_CONTROL_START_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("SIB_CONTROL_TARGET") {
            self.control.target = raw.trim().to_string();
        }
        set_u64(
            &mut lookup,
            "SIB_CONTROL_TICK_INTERVAL_MS",
            &mut self.control.tick_interval_ms,
        )?;

        // announce
        if let Some(raw) = lookup("SIB_ANNOUNCE_HOOK_COMMAND") {
            self.announce.hook_command = Some(PathBuf::from(raw));
        }

        // paths
        if let Some(raw) = lookup("SIB_PATHS_ACTIVITY_LOG") {
            self.paths.activity_log = PathBuf::from(raw);
        }

        Ok(())
    }

    /// Reject values the controller cannot run with. [`Config::load`] calls this;
    /// hosts that build a `Config` in code get it from `BoostController::new`.
    pub fn validate(&self) -> Result<()> {
        if self.window.width_ms == 0 {
            return Err(SibError::InvalidConfig {
                details: "window.width_ms must be > 0".to_string(),
            });
        }
        if !(9..=16).contains(&self.window.page_shift) {
            return Err(SibError::InvalidConfig {
                details: format!(
                    "window.page_shift must be in [9,16], got {}",
                    self.window.page_shift
                ),
            });
        }
        if self.window.threshold_pages() == 0 {
            return Err(SibError::InvalidConfig {
                details: format!(
                    "window.threshold_bytes ({}) must cover at least one page (1 << {})",
                    self.window.threshold_bytes, self.window.page_shift
                ),
            });
        }
        if self.notifier.retry_backoff_ms > 60_000 {
            return Err(SibError::InvalidConfig {
                details: format!(
                    "notifier.retry_backoff_ms must be <= 60000, got {}",
                    self.notifier.retry_backoff_ms
                ),
            });
        }
        if self.control.target.trim().is_empty() {
            return Err(SibError::InvalidConfig {
                details: "control.target must not be empty".to_string(),
            });
        }
        if let Some(hook) = &self.announce.hook_command
            && hook.as_os_str().is_empty()
        {
            return Err(SibError::InvalidConfig {
                details: "announce.hook_command must not be empty when set".to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn set_u64<F>(lookup: &mut F, name: &str, slot: &mut u64) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env_u64(name, &raw)?;
    }
    Ok(())
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|error| SibError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SibError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: expected a boolean"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, SibError, THRESHOLD_PAGES};
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::Duration;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        cfg.validate().expect("default config should validate");
    }

    #[test]
    fn default_threshold_is_32_mib_in_pages() {
        let cfg = Config::default();
        assert_eq!(cfg.window.threshold_pages(), 8_192);
        assert_eq!(THRESHOLD_PAGES, 8_192);
        assert_eq!(cfg.window.width(), Duration::from_millis(100));
    }

    #[test]
    fn tick_interval_falls_back_to_window_width() {
        let mut cfg = Config::default();
        assert_eq!(
            cfg.control.tick_interval(&cfg.window),
            Duration::from_millis(100)
        );
        cfg.control.tick_interval_ms = 25;
        assert_eq!(
            cfg.control.tick_interval(&cfg.window),
            Duration::from_millis(25)
        );
    }

    #[test]
    fn zero_window_width_rejected() {
        let mut cfg = Config::default();
        cfg.window.width_ms = 0;
        assert!(matches!(
            cfg.validate(),
            Err(SibError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn threshold_below_one_page_rejected() {
        let mut cfg = Config::default();
        cfg.window.threshold_bytes = 1024;
        let err = cfg.validate().expect_err("sub-page threshold must fail");
        assert_eq!(err.code(), "SIB-1001");
    }

    #[test]
    fn page_shift_out_of_range_rejected() {
        let mut cfg = Config::default();
        cfg.window.page_shift = 40;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_target_rejected() {
        let mut cfg = Config::default();
        cfg.control.target = "   ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn stable_hash_changes_when_config_changes() {
        let base = Config::default();
        let mut changed = base.clone();
        changed.window.width_ms = 250;
        assert_ne!(
            base.stable_hash().expect("hash"),
            changed.stable_hash().expect("hash")
        );
        assert_eq!(
            base.stable_hash().expect("hash"),
            base.clone().stable_hash().expect("hash")
        );
    }

    #[test]
    fn env_overrides_apply() {
        let env = vars(&[
            ("SIB_WINDOW_WIDTH_MS", "250"),
            ("SIB_WINDOW_THRESHOLD_BYTES", "1048576"),
            ("SIB_NOTIFIER_RETRY_BACKOFF_MS", "5"),
            ("SIB_CONTROL_START_ENABLED", "false"),
            ("SIB_CONTROL_TARGET", "mmc"),
            ("SIB_ANNOUNCE_HOOK_COMMAND", "/usr/bin/true"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_env_overrides_from(|name| env.get(name).cloned())
            .expect("overrides apply");

        assert_eq!(cfg.window.width_ms, 250);
        assert_eq!(cfg.window.threshold_pages(), 256);
        assert_eq!(cfg.notifier.retry_backoff_ms, 5);
        assert!(!cfg.control.start_enabled);
        assert_eq!(cfg.control.target, "mmc");
        assert_eq!(
            cfg.announce.hook_command.as_deref(),
            Some(Path::new("/usr/bin/true"))
        );
    }

    #[test]
    fn env_invalid_number_rejected() {
        let env = vars(&[("SIB_WINDOW_WIDTH_MS", "fast")]);
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_overrides_from(|name| env.get(name).cloned())
            .expect_err("non-numeric width must fail");
        assert!(matches!(err, SibError::ConfigParse { context: "env", .. }));
    }

    #[test]
    fn env_invalid_boolean_rejected() {
        let env = vars(&[("SIB_CONTROL_START_ENABLED", "maybe")]);
        let mut cfg = Config::default();
        assert!(
            cfg.apply_env_overrides_from(|name| env.get(name).cloned())
                .is_err()
        );
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [window]
            width_ms = 50

            [control]
            target = "mmc"
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.window.width_ms, 50);
        assert_eq!(cfg.window.page_shift, 12);
        assert_eq!(cfg.control.target, "mmc");
        assert!(cfg.control.start_enabled);
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[window]\nthreshold_bytes = 4194304\n").expect("write");
        let cfg = Config::load(Some(&path)).expect("load");
        assert_eq!(cfg.window.threshold_pages(), 1_024);
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let err = Config::load(Some(Path::new("/nonexistent/sib/config.toml")))
            .expect_err("missing explicit config must fail");
        assert!(matches!(err, SibError::MissingConfig { .. }));
    }
}
