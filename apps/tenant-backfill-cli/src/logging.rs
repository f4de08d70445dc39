use crate::config::{LogFormat, LoggingConfig};
use anyhow::{Context, Result, anyhow};
use std::io::IsTerminal;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Text => fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer)
            .boxed(),
    }
}

/// Install the global subscriber: stderr plus an optional log file.
///
/// Keep the returned guard alive until exit so buffered file output is flushed.
///
/// # Errors
/// Fails on an invalid filter directive, an unusable log file path, or when a
/// subscriber is already installed.
pub fn init_logging(cfg: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .with_context(|| format!("invalid logging.level '{}'", cfg.level))?;

    let stderr_ansi = std::io::stderr().is_terminal();
    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(cfg.format, std::io::stderr, stderr_ansi)];

    let mut guard = None;
    if let Some(path) = &cfg.file {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .ok_or_else(|| anyhow!("logging.file has no file name: {}", path.display()))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create log directory {}", dir.display()))?;

        let (writer, worker) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
        layers.push(fmt_layer(cfg.format, writer, false));
        guard = Some(worker);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("logging is already initialized")?;
    Ok(guard)
}
