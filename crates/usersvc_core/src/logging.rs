//! Service logging bootstrap and safety policy.
//!
//! # Responsibility
//! - Initialize stdout and/or rolling file logs exactly once per process.
//! - Emit stable, metadata-only diagnostic events.
//!
//! # Invariants
//! - Logging init is idempotent for the same configuration.
//! - Logging initialization must not panic.
//! - Re-initialization with a different level, output or path is rejected.
//! - Bound SQL argument values never reach the log.

use crate::config::LogConfig;
use flexi_logger::{
    Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming, WriteMode,
};
use log::{error, info};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};

const MAX_LOG_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: usize = 5;
const MAX_PANIC_PAYLOAD_CHARS: usize = 160;

static LOGGING_STATE: OnceCell<LoggingState> = OnceCell::new();
static PANIC_HOOK_INSTALLED: OnceCell<()> = OnceCell::new();

/// Where log records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File,
    FileAndStdout,
}

impl LogOutput {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::File => "file",
            Self::FileAndStdout => "file|stdout",
        }
    }

    fn writes_file(self) -> bool {
        !matches!(self, Self::Stdout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    level: &'static str,
    output: LogOutput,
    path: Option<PathBuf>,
}

struct LoggingState {
    settings: Settings,
    _logger: LoggerHandle,
}

/// Initializes service logging from `config`.
///
/// Returns `Ok(())` when logging is active, or a human-readable error string
/// when initialization fails.
///
/// # Errors
/// - Returns an error when the level or output is unsupported.
/// - Returns an error when file output has no absolute path.
/// - Returns an error when logging is already active with other settings.
/// - Returns an error when logger backend setup fails.
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let requested = normalize(config)?;

    if let Some(state) = LOGGING_STATE.get() {
        return check_same(&state.settings, &requested);
    }

    let state = LOGGING_STATE.get_or_try_init(|| -> Result<LoggingState, String> {
        let logger = start_logger(&requested)?;
        install_panic_hook_once();

        info!(
            "event=app_start module=core status=ok platform={} build_mode={} version={}",
            std::env::consts::OS,
            build_mode(),
            env!("CARGO_PKG_VERSION")
        );
        info!(
            "event=logging_init module=core status=ok level={} output={} path={}",
            requested.level,
            requested.output.as_str(),
            requested
                .path
                .as_deref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "-".to_string())
        );

        Ok(LoggingState {
            settings: requested.clone(),
            _logger: logger,
        })
    })?;

    check_same(&state.settings, &requested)
}

/// Returns `(level, output)` of the active logger, if any.
pub fn logging_status() -> Option<(&'static str, &'static str)> {
    LOGGING_STATE
        .get()
        .map(|state| (state.settings.level, state.settings.output.as_str()))
}

/// Returns the default log level for current build mode.
///
/// - `debug` builds -> `debug`
/// - `release` builds -> `info`
pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn start_logger(settings: &Settings) -> Result<LoggerHandle, String> {
    let logger = Logger::try_with_str(settings.level)
        .map_err(|err| format!("invalid log level `{}`: {err}", settings.level))?;

    let logger = match (&settings.path, settings.output) {
        (Some(path), output) if output.writes_file() => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    format!("failed to create log directory `{}`: {err}", parent.display())
                })?;
            }
            let spec = FileSpec::try_from(path.as_path())
                .map_err(|err| format!("invalid log path `{}`: {err}", path.display()))?;
            let duplicate = if output == LogOutput::FileAndStdout {
                Duplicate::All
            } else {
                Duplicate::None
            };
            logger
                .log_to_file(spec)
                .rotate(
                    Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
                    Naming::Numbers,
                    Cleanup::KeepLogFiles(MAX_LOG_FILES),
                )
                .write_mode(WriteMode::BufferAndFlush)
                .append()
                .duplicate_to_stdout(duplicate)
                .format_for_files(flexi_logger::detailed_format)
                .format_for_stdout(flexi_logger::detailed_format)
        }
        _ => logger
            .log_to_stdout()
            .format(flexi_logger::detailed_format),
    };

    logger
        .start()
        .map_err(|err| format!("failed to start logger: {err}"))
}

fn check_same(active: &Settings, requested: &Settings) -> Result<(), String> {
    if active == requested {
        return Ok(());
    }
    Err(format!(
        "logging already initialized with level `{}` output `{}`; refusing to switch to level `{}` output `{}`",
        active.level,
        active.output.as_str(),
        requested.level,
        requested.output.as_str()
    ))
}

fn normalize(config: &LogConfig) -> Result<Settings, String> {
    let level = normalize_level(&config.level)?;
    let output = normalize_output(&config.output)?;
    let path = if output.writes_file() {
        Some(normalize_log_path(config.path.as_deref())?)
    } else {
        None
    };
    Ok(Settings {
        level,
        output,
        path,
    })
}

fn normalize_level(level: &str) -> Result<&'static str, String> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" => Ok("error"),
        other => Err(format!(
            "unsupported log level `{other}`; expected trace|debug|info|warn|error"
        )),
    }
}

fn normalize_output(output: &str) -> Result<LogOutput, String> {
    let mut file = false;
    let mut stdout = false;
    for part in output.split('|').map(|part| part.trim().to_ascii_lowercase()) {
        match part.as_str() {
            "file" => file = true,
            "stdout" => stdout = true,
            other => {
                return Err(format!(
                    "unsupported log output `{other}`; expected stdout|file|file|stdout"
                ))
            }
        }
    }
    match (file, stdout) {
        (true, true) => Ok(LogOutput::FileAndStdout),
        (true, false) => Ok(LogOutput::File),
        _ => Ok(LogOutput::Stdout),
    }
}

fn normalize_log_path(path: Option<&Path>) -> Result<PathBuf, String> {
    let path = path.ok_or_else(|| "log path is required for file output".to_string())?;
    if path.as_os_str().is_empty() {
        return Err("log path cannot be empty".to_string());
    }
    if !path.is_absolute() {
        return Err(format!(
            "log path must be absolute, got `{}`",
            path.display()
        ));
    }
    Ok(path.to_path_buf())
}

fn build_mode() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}

fn install_panic_hook_once() {
    if PANIC_HOOK_INSTALLED.get().is_some() {
        return;
    }

    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        // Panic payloads may echo request data; keep them single-line and short.
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_summary(panic_info);
        error!(
            "event=panic_captured module=core status=error location={} payload={}",
            location, payload
        );
        previous_hook(panic_info);
    }));

    let _ = PANIC_HOOK_INSTALLED.set(());
}

fn panic_payload_summary(info: &std::panic::PanicHookInfo<'_>) -> String {
    let payload = if let Some(message) = info.payload().downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = info.payload().downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    };

    sanitize_message(&payload, MAX_PANIC_PAYLOAD_CHARS)
}

fn sanitize_message(value: &str, max_chars: usize) -> String {
    let normalized = value.replace(['\n', '\r'], " ");
    let mut truncated = normalized.chars().take(max_chars).collect::<String>();
    if normalized.chars().count() > max_chars {
        truncated.push_str("...");
    }
    truncated
}
