use tracing_subscriber::{EnvFilter, fmt};

use crate::{Config, Result};

/// Initialises the global `tracing` subscriber from `config.log`. Simplified
/// from the teacher's `core::log` module: no journald detection, no
/// flamegraph/sentry/opentelemetry layers — none of those have a
/// counterpart in this proxy's scope (see DESIGN.md).
pub fn init(config: &Config) -> Result<()> {
	let filter = EnvFilter::try_new(&config.log)?;
	fmt().with_env_filter(filter).with_target(true).init();
	Ok(())
}
