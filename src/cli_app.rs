//! Top-level CLI definition and dispatch.

use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{Receiver, unbounded};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use storage_io_booster::boost::announce::{
    Announcer, BoostEvent, ChannelAnnouncer, CommandAnnouncer,
};
use storage_io_booster::boost::controller::{BoostController, BoostOutcome};
use storage_io_booster::control::surface::ControlSurface;
use storage_io_booster::core::config::Config;
use storage_io_booster::core::errors::SibError;
use storage_io_booster::daemon::ticker::{TickBoost, WindowTicker};
use storage_io_booster::logger::activity::{ActivityLoggerConfig, spawn_logger};
use storage_io_booster::logger::jsonl::JsonlConfig;
use storage_io_booster::monitor::telemetry::SampledTelemetry;

/// Capacity of the in-process collector used when no hook is configured.
const COLLECTOR_CAPACITY: usize = 1024;

/// Storage I/O booster: announces boost state from block-I/O traffic windows.
#[derive(Debug, Parser)]
#[command(
    name = "sib",
    author,
    version,
    about = "Storage I/O Booster - traffic-driven boost announcements",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// View configuration state.
    Config(ConfigArgs),
    /// Drive a controller from a recorded traffic trace.
    Replay(ReplayArgs),
}

#[derive(Debug, Clone, Args, Serialize, Default)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand, Serialize)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args, Serialize)]
struct ReplayArgs {
    /// JSONL trace: `{"at_ms","write","bytes"}` samples or `{"at_ms","command"}` lines.
    #[arg(value_name = "TRACE")]
    trace: PathBuf,
    /// Write activity events to the configured activity log.
    #[arg(long)]
    log: bool,
    /// Pace the trace in wall-clock time and let a window ticker run the checks.
    #[arg(long)]
    realtime: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl From<SibError> for CliError {
    fn from(err: SibError) -> Self {
        if err.is_retryable() {
            Self::Runtime(err.to_string())
        } else if matches!(err, SibError::Serialization { .. }) {
            Self::Internal(err.to_string())
        } else {
            Self::User(err.to_string())
        }
    }
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
        }
    }
}

/// One line of a replay trace.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum TraceRecord {
    Io { at_ms: u64, write: bool, bytes: u32 },
    Command { at_ms: u64, command: String },
}

impl TraceRecord {
    const fn at_ms(&self) -> u64 {
        match self {
            Self::Io { at_ms, .. } | Self::Command { at_ms, .. } => *at_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ReplayTransition {
    at_ms: u64,
    boosted: bool,
    cause: &'static str,
    read_pages: u64,
    write_pages: u64,
}

impl ReplayTransition {
    fn from_tick(base: Instant, tick: TickBoost) -> Self {
        Self {
            at_ms: millis_since(base, tick.at),
            boosted: true,
            cause: "ticker",
            read_pages: tick.read_pages,
            write_pages: tick.write_pages,
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    match &cli.command {
        Command::Config(args) => run_config(cli, args),
        Command::Replay(args) => run_replay(cli, args),
    }
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config
                    .stable_hash()
                    .map_err(|e| CliError::Runtime(e.to_string()))?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "code": e.code(),
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

#[allow(clippy::too_many_lines)]
fn run_replay(cli: &Cli, args: &ReplayArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let raw = fs::read_to_string(&args.trace).map_err(|e| {
        CliError::User(format!("cannot read trace {}: {e}", args.trace.display()))
    })?;
    let records = parse_trace(&raw)?;

    let (logger, logger_join) = if args.log {
        let jsonl = JsonlConfig::at(&config.paths.activity_log);
        let (handle, join) = spawn_logger(ActivityLoggerConfig::new(jsonl))?;
        (Some(handle), Some(join))
    } else {
        (None, None)
    };

    let (announcer, collected): (Arc<dyn Announcer>, Option<Receiver<BoostEvent>>) =
        if let Some(program) = &config.announce.hook_command {
            let hook: Arc<dyn Announcer> = Arc::new(CommandAnnouncer::new(program));
            (hook, None)
        } else {
            let (channel, rx) = ChannelAnnouncer::bounded(COLLECTOR_CAPACITY);
            let channel: Arc<dyn Announcer> = Arc::new(channel);
            (channel, Some(rx))
        };

    let controller = Arc::new(
        BoostController::new(
            &config,
            Arc::new(SampledTelemetry::new()),
            announcer,
            logger.clone(),
        )?,
    );
    let surface = ControlSurface::new(Arc::clone(&controller));

    let base = Instant::now();
    let tick_interval = config.control.tick_interval(&config.window);
    let mut ticker = if args.realtime {
        let (tx, rx) = unbounded();
        let ticker = WindowTicker::spawn_reporting(Arc::clone(&controller), tick_interval, tx)?;
        Some((ticker, rx))
    } else {
        None
    };

    let mut transitions = Vec::new();
    let mut last_at = base;
    for record in &records {
        let at = base + Duration::from_millis(record.at_ms());
        last_at = at;
        if ticker.is_some() {
            thread::sleep(at.saturating_duration_since(Instant::now()));
        }
        match record {
            TraceRecord::Io {
                at_ms,
                write,
                bytes,
            } => {
                controller.account_io(*write, *bytes);
                if ticker.is_some() {
                    continue;
                }
                let before = controller.snapshot(at);
                if controller.check_elapsed(at) == Some(BoostOutcome::Changed) {
                    transitions.push(ReplayTransition {
                        at_ms: *at_ms,
                        boosted: true,
                        cause: "window",
                        read_pages: before.read_pages,
                        write_pages: before.write_pages,
                    });
                }
            }
            TraceRecord::Command { at_ms, command } => {
                let before = controller.snapshot(at);
                surface
                    .handle_command_at(command.as_bytes(), at)
                    .map_err(|e| CliError::User(format!("trace at {at_ms}ms: {e}")))?;
                if before.boosted && !controller.is_boosted() {
                    transitions.push(ReplayTransition {
                        at_ms: *at_ms,
                        boosted: false,
                        cause: "command",
                        read_pages: before.read_pages,
                        write_pages: before.write_pages,
                    });
                }
            }
        }
    }

    if let Some((mut window_ticker, reports)) = ticker.take() {
        settle_ticker(&window_ticker, config.window.width(), tick_interval);
        window_ticker.stop();
        last_at = last_at.max(Instant::now());
        transitions.extend(reports.try_iter().map(|tick| ReplayTransition::from_tick(base, tick)));
        transitions.sort_by_key(|t| t.at_ms);
    }

    let converged = controller
        .notifier()
        .wait_idle(config.notifier.shutdown_timeout());
    let snapshot = controller.snapshot(last_at);
    let stats = controller.notifier_stats();
    let status = surface.status_report();
    controller.shutdown("replay complete");

    let announced: Vec<String> = collected
        .map(|rx| rx.try_iter().map(|event| event.to_string()).collect())
        .unwrap_or_default();

    if let Some(logger) = logger {
        logger.shutdown();
    }
    if let Some(join) = logger_join {
        join.join()
            .map_err(|_| CliError::Internal("logger thread panicked".to_string()))?;
    }

    match output_mode(cli) {
        OutputMode::Human => {
            println!(
                "Replayed {} records from {}",
                records.len(),
                args.trace.display()
            );
            for t in &transitions {
                println!(
                    "  {:>8}ms  boost={}  ({}; read_pages={} write_pages={})",
                    t.at_ms,
                    u8::from(t.boosted),
                    t.cause,
                    t.read_pages,
                    t.write_pages
                );
            }
            if transitions.is_empty() {
                println!("  (no boost transitions)");
            }
            if !announced.is_empty() {
                println!("Announced: {}", announced.join(", "));
            }
            print!("{status}");
            println!(
                "Notifier: requested={} published={} deliveries={} failures={}",
                u8::from(stats.requested),
                u8::from(stats.published),
                stats.deliveries,
                stats.failures
            );
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "replay",
                "trace": args.trace.to_string_lossy(),
                "records": records.len(),
                "transitions": serde_json::to_value(&transitions)?,
                "announced": announced,
                "converged": converged,
                "snapshot": serde_json::to_value(snapshot)?,
                "notifier": serde_json::to_value(stats)?,
            });
            write_json_line(&payload)?;
        }
    }

    if converged {
        Ok(())
    } else {
        Err(CliError::Runtime(format!(
            "announcements did not converge within {:?}",
            config.notifier.shutdown_timeout()
        )))
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

/// Wait until the ticker has evaluated a window that opened no later than now.
fn settle_ticker(ticker: &WindowTicker, width: Duration, interval: Duration) {
    let per_window = width.as_nanos().div_ceil(interval.as_nanos().max(1));
    let needed = u64::try_from(per_window)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    let target = ticker.ticks().saturating_add(needed);
    let deadline = Instant::now() + (width + interval) * 4 + Duration::from_secs(1);
    while ticker.ticks() < target && Instant::now() < deadline {
        thread::sleep(interval.min(Duration::from_millis(10)));
    }
}

fn millis_since(base: Instant, at: Instant) -> u64 {
    u64::try_from(at.saturating_duration_since(base).as_millis()).unwrap_or(u64::MAX)
}

/// Parse a JSONL trace. Blank lines and `#` comments are skipped; timestamps
/// must not go backwards.
fn parse_trace(raw: &str) -> Result<Vec<TraceRecord>, CliError> {
    let mut records = Vec::new();
    let mut last_at = 0;
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let record: TraceRecord = serde_json::from_str(line)
            .map_err(|e| CliError::User(format!("trace line {}: {e}", index + 1)))?;
        if record.at_ms() < last_at {
            return Err(CliError::User(format!(
                "trace line {}: at_ms {} is earlier than {last_at}",
                index + 1,
                record.at_ms()
            )));
        }
        last_at = record.at_ms();
        records.push(record);
    }
    Ok(records)
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("SIB_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_before_and_after_subcommand() {
        let before = Cli::try_parse_from(["sib", "--config", "/tmp/sib.toml", "--json", "config"]);
        assert!(before.is_ok());

        let after = Cli::try_parse_from(["sib", "config", "show", "--json"]);
        assert!(after.is_ok());
    }

    #[test]
    fn parses_subcommands() {
        let cases = [
            vec!["sib", "config", "path"],
            vec!["sib", "config", "validate"],
            vec!["sib", "replay", "trace.jsonl"],
            vec!["sib", "replay", "trace.jsonl", "--log"],
            vec!["sib", "replay", "trace.jsonl", "--realtime"],
        ];
        for case in cases {
            let parsed = Cli::try_parse_from(case.clone());
            assert!(parsed.is_ok(), "failed to parse case: {case:?}");
        }
    }

    #[test]
    fn replay_requires_trace() {
        assert!(Cli::try_parse_from(["sib", "replay"]).is_err());
    }

    #[test]
    fn output_mode_resolution() {
        assert_eq!(resolve_output_mode(true, Some("human"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("JSON"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("human"), false), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, None, true), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, Some("auto"), false), OutputMode::Json);
    }

    #[test]
    fn exit_codes_follow_contract() {
        assert_eq!(CliError::User(String::new()).exit_code(), 1);
        assert_eq!(CliError::Runtime(String::new()).exit_code(), 2);
        assert_eq!(CliError::Internal(String::new()).exit_code(), 3);
    }

    #[test]
    fn library_errors_map_to_exit_codes() {
        let user = CliError::from(SibError::InvalidConfig {
            details: "window.width_ms must be > 0".to_string(),
        });
        assert_eq!(user.exit_code(), 1);
        assert!(user.to_string().contains("SIB-1001"));

        let runtime = CliError::from(SibError::Runtime {
            details: "spawn failed".to_string(),
        });
        assert_eq!(runtime.exit_code(), 2);

        let internal = CliError::from(SibError::Serialization {
            context: "serde_json",
            details: "bad".to_string(),
        });
        assert_eq!(internal.exit_code(), 3);
    }

    #[test]
    fn settle_ticker_returns_once_enough_ticks_pass() {
        let config = Config::default();
        let (announcer, _rx) = ChannelAnnouncer::bounded(1);
        let controller = Arc::new(
            BoostController::new(
                &config,
                Arc::new(SampledTelemetry::new()),
                Arc::new(announcer),
                None,
            )
            .unwrap(),
        );
        let interval = Duration::from_millis(5);
        let mut ticker = WindowTicker::spawn(controller, interval).unwrap();
        let before = ticker.ticks();
        settle_ticker(&ticker, Duration::from_millis(10), interval);
        assert!(ticker.ticks() >= before + 3);
        ticker.stop();
    }

    #[test]
    fn trace_parses_samples_and_commands() {
        let raw = r#"
            # warmup
            {"at_ms": 0, "write": true, "bytes": 1048576}

            {"at_ms": 50, "command": "0"}
            {"at_ms": 120, "write": false, "bytes": 4096}
        "#;
        let records = parse_trace(raw).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[0],
            TraceRecord::Io {
                at_ms: 0,
                write: true,
                bytes: 1_048_576
            }
        );
        assert_eq!(
            records[1],
            TraceRecord::Command {
                at_ms: 50,
                command: "0".to_string()
            }
        );
    }

    #[test]
    fn trace_rejects_time_going_backwards() {
        let raw = "{\"at_ms\": 10, \"write\": true, \"bytes\": 1}\n{\"at_ms\": 5, \"write\": true, \"bytes\": 1}\n";
        let err = parse_trace(raw).unwrap_err();
        assert!(matches!(err, CliError::User(_)));
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn trace_rejects_malformed_line() {
        let err = parse_trace("{\"at_ms\": 1}\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
