//! Installs the `log` crate facade over the console sink (§1 ambient stack).

use log::{Level, LevelFilter, Metadata, Record};

use crate::arch::x86_64::kernel::percore::core_id;

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= max_level()
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}

		crate::println!(
			"[{}][{}] {}",
			core_id(),
			level_tag(record.level()),
			record.args()
		);
	}

	fn flush(&self) {}
}

fn level_tag(level: Level) -> &'static str {
	match level {
		Level::Error => "ERROR",
		Level::Warn => "WARNING",
		Level::Info => "INFO",
		Level::Debug => "DEBUG",
		Level::Trace => "TRACE",
	}
}

const fn max_level() -> LevelFilter {
	if cfg!(debug_assertions) {
		LevelFilter::Debug
	} else {
		LevelFilter::Info
	}
}

/// Installs the kernel logger. Must run before any `log::info!` etc. call;
/// the console sink itself has no prerequisites, so this can run as the
/// very first step of `kernel::boot()`.
pub fn init() {
	log::set_logger(&LOGGER)
		.map(|()| log::set_max_level(max_level()))
		.expect("logging::init called twice");
}
