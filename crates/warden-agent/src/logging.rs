use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

const DIAGNOSTIC_FILE_PREFIX: &str = "warden-agent.log";

fn default_filter(cfg: &LoggingConfig) -> EnvFilter {
    let level = if cfg.verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber.
///
/// Human-readable output goes to stderr. When a diagnostic directory is set,
/// the same events (including full error chains) also go to a daily-rolling
/// file; keep the returned guard alive or buffered lines are lost on exit.
pub fn init(cfg: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let Some(dir) = cfg.diagnostic_dir.as_ref() else {
        tracing_subscriber::registry()
            .with(default_filter(cfg))
            .with(stderr_layer)
            .try_init()
            .context("install tracing subscriber")?;
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("create diagnostic log dir {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, DIAGNOSTIC_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(default_filter(cfg))
        .with(stderr_layer)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .context("install tracing subscriber")?;

    tracing::debug!(dir = %dir.display(), "diagnostic log enabled");
    Ok(Some(guard))
}
