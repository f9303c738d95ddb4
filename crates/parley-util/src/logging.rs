use anyhow::{Context, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the non-blocking file writer alive. Dropping it flushes and stops
/// file logging.
#[derive(Default)]
pub struct LogHandle {
    pub path: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

fn build_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info").to_lowercase()))
}

/// Timestamped log file name inside `log_dir`.
pub fn log_file_path(log_dir: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y-%m-%dT%H%M%S");
    log_dir.join(format!("parley-{}.log", timestamp))
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over `level`. With `print` the output goes to stderr,
/// otherwise to a fresh file in `log_dir` (default: current directory).
pub fn init_tracing(level: Option<&str>, log_dir: Option<PathBuf>, print: bool) -> Result<LogHandle> {
    let filter = build_filter(level);

    if print {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .context("tracing subscriber already installed")?;
        return Ok(LogHandle::default());
    }

    let log_dir = log_dir.unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;
    let log_path = log_file_path(&log_dir);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file: {:?}", log_path))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(LogHandle {
        path: Some(log_path),
        _guard: Some(guard),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_lives_in_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_file_path(dir.path());
        assert_eq!(path.parent(), Some(dir.path()));
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("parley-"));
        assert!(name.ends_with(".log"));
    }
}
