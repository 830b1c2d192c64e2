//! Tracing setup for applications embedding the client.
//!
//! Console output is always installed. When stdout is not a terminal, a daily
//! rotating file under the platform data directory is added. The filter comes
//! from `MASTER_CLIENT_LOG`, then `RUST_LOG`, then a build-type default.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable read before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "MASTER_CLIENT_LOG";

const LOG_FILE_PREFIX: &str = "master_client";
const MAX_LOG_FILES: usize = 14;

/// Where and how much to log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for log files; `None` logs to the console only.
    pub log_dir: Option<PathBuf>,
    pub is_tty: bool,
    /// Filter directives overriding the environment.
    pub log_filter: Option<String>,
}

impl LogConfig {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir: Some(log_dir), is_tty: atty::is(atty::Stream::Stdout), log_filter: None }
    }

    /// Console output only.
    pub fn console() -> Self {
        Self { log_dir: None, is_tty: atty::is(atty::Stream::Stdout), log_filter: None }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// The file directory, when file output applies.
    fn file_dir(&self) -> Option<&Path> {
        match self.is_tty {
            true => None,
            false => self.log_dir.as_deref(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new(log_dir())
    }
}

/// Keeps the file writer alive. Dropping it flushes pending entries.
#[must_use = "file logging stops when the guard is dropped"]
pub struct LoggingGuard {
    file: Option<WorkerGuard>,
    installed: bool,
}

impl LoggingGuard {
    /// Whether log lines also go to a file.
    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }

    /// Whether this call installed the global subscriber. False when one was
    /// already set.
    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

/// Install the global subscriber.
///
/// A file that cannot be opened degrades to console-only output.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    let filter = build_env_filter(config.log_filter.as_deref());

    let (writer, guard) = match config.file_dir().map(open_log_file) {
        Some(Ok((writer, guard))) => (Some(writer), Some(guard)),
        Some(Err(e)) => {
            eprintln!("master_client: file logging disabled: {e}");
            (None, None)
        }
        None => (None, None),
    };

    let console = fmt::layer().with_ansi(config.is_tty).with_target(writer.is_some());
    let file = writer.map(|writer| fmt::layer().with_writer(writer).with_ansi(false).with_target(true));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .is_ok();

    LoggingGuard { file: guard, installed }
}

fn open_log_file(
    dir: &Path,
) -> Result<(NonBlocking, WorkerGuard), Box<dyn std::error::Error + Send + Sync>> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(dir)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Custom directives win over the environment; unparsable ones fall back to
/// the default.
fn build_env_filter(custom: Option<&str>) -> EnvFilter {
    let fallback = || EnvFilter::new(default_log_filter());
    match custom {
        Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|_| fallback()),
        None => EnvFilter::try_from_env(LOG_ENV_VAR)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| fallback()),
    }
}

/// Default directives for the current build type.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "info,master_client=debug"
    } else {
        "warn,master_client=info"
    }
}

/// Platform log directory for the client.
pub fn log_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join(LOG_FILE_PREFIX).join("logs")
}
