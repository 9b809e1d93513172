use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
	filter::LevelFilter,
	fmt::{self, Layer},
	prelude::*,
	EnvFilter,
};

#[cfg(debug_assertions)]
const CONSOLE_LOG_FILTER: LevelFilter = LevelFilter::DEBUG;

#[cfg(not(debug_assertions))]
const CONSOLE_LOG_FILTER: LevelFilter = LevelFilter::INFO;

/// Sets up console logging plus a daily rolling file under `logs_dir`.
///
/// `RUST_LOG` takes precedence over `default_level`. Installing a second global subscriber
/// is tolerated, so several nodes can live in one process (tests do this). The returned
/// guard flushes the file writer when dropped and must be kept alive.
pub fn init_logger(logs_dir: &Path, default_level: &str) -> Result<WorkerGuard> {
	std::fs::create_dir_all(logs_dir)
		.with_context(|| format!("creating logs directory {}", logs_dir.display()))?;

	let (non_blocking, guard) =
		tracing_appender::non_blocking(rolling::daily(logs_dir, "looking-glass.log"));

	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(default_level))
		.with_context(|| format!("invalid log level '{default_level}'"))?;

	if let Err(e) = tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer().with_filter(CONSOLE_LOG_FILTER))
		.with(
			Layer::default()
				.with_writer(non_blocking)
				.with_ansi(false)
				.with_filter(LevelFilter::DEBUG),
		)
		.try_init()
	{
		debug!(%e, "Logger already initialized;");
	}

	Ok(guard)
}
