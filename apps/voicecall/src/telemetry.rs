use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const LOG_FILTER_ENV: &str = "VOICECALL_LOG_FILTER";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config.level.to_filter()))
        .with_level(true)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    let _ = GUARD.set(guard);
    Ok(())
}

fn env_filter(level: LevelFilter) -> EnvFilter {
    match std::env::var(LOG_FILTER_ENV) {
        Ok(filter) => EnvFilter::new(filter),
        Err(_) => EnvFilter::new(default_filter(level)),
    }
}

/// Our own targets follow the chosen level; webrtc internals stay at info
/// below trace and dependency chatter is capped at warn.
fn default_filter(level: LevelFilter) -> String {
    let ours = level.to_string().to_ascii_lowercase();
    match level {
        LevelFilter::TRACE | LevelFilter::DEBUG => {
            let deps = if level == LevelFilter::TRACE { "debug" } else { "info" };
            format!(
                "warn,voicecall={ours},call={ours},webrtc={deps},webrtc_ice={deps},tungstenite=warn,tokio_tungstenite=warn"
            )
        }
        _ => format!("{ours},voicecall={ours},call={ours}"),
    }
}
