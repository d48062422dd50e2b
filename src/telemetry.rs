//! Tracing setup shared by both binaries: `RUST_LOG` wins over the
//! configured level, and `-L <file>` swaps stderr for a non-blocking file
//! writer whose guard must outlive the process.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub fn init(level: &str, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
	match log_file {
		Some(path) => {
			let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
			let name = path
				.file_name()
				.ok_or_else(|| anyhow::anyhow!("log file has no file name: {}", path.display()))?;
			let appender =
				tracing_appender::rolling::never(dir.unwrap_or_else(|| Path::new(".")), name);
			let (writer, guard) = tracing_appender::non_blocking(appender);
			tracing_subscriber::fmt()
				.with_env_filter(filter)
				.with_writer(writer)
				.with_ansi(false)
				.init();
			Ok(Some(guard))
		},
		None => {
			tracing_subscriber::fmt()
				.with_env_filter(filter)
				.with_writer(std::io::stderr)
				.init();
			Ok(None)
		},
	}
}
