use std::{net::SocketAddr, path::PathBuf};

use figment::{
	Figment,
	providers::{Env, Format, Toml},
};
use serde::Deserialize;

use crate::Result;

/// All configuration for the proxy. Loaded from an optional TOML file
/// overlaid with `SYNC3_`-prefixed environment variables, the same two
/// providers (`Toml`, `Env`) the teacher's `core::config::Config` combines
/// with `figment`.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
	/// Address the sliding-sync HTTP endpoint listens on.
	#[serde(default = "default_listen")]
	pub listen: SocketAddr,

	/// Base URL of the upstream homeserver's client-server API, e.g.
	/// `https://matrix.example.org`.
	pub upstream_base_url: String,

	/// Where the RocksDB store lives on disk.
	#[serde(default = "default_database_path")]
	pub database_path: PathBuf,

	/// Timeout for a single upstream long-poll `/sync` request.
	#[serde(default = "default_upstream_poll_timeout_secs")]
	pub upstream_poll_timeout_secs: u64,

	/// Initial upstream transport-error backoff.
	#[serde(default = "default_backoff_min_secs")]
	pub backoff_min_secs: u64,

	/// Cap on upstream transport-error backoff.
	#[serde(default = "default_backoff_max_secs")]
	pub backoff_max_secs: u64,

	/// Timeout for a sliding-sync long-poll request (§5).
	#[serde(default = "default_long_poll_timeout_secs")]
	pub long_poll_timeout_secs: u64,

	/// How long an idle Connection survives before the Notifier evicts it
	/// (§5).
	#[serde(default = "default_idle_connection_ttl_secs")]
	pub idle_connection_ttl_secs: u64,

	/// Upper bound on a list's `timeline_limit`, independent of whatever a
	/// client asks for.
	#[serde(default = "default_max_timeline_limit")]
	pub max_timeline_limit: u32,

	/// `tracing_subscriber::EnvFilter` directive string.
	#[serde(default = "default_log")]
	pub log: String,
}

impl Config {
	/// Loads config from an optional TOML file plus `SYNC3_*` environment
	/// overrides.
	pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
		let mut figment = Figment::new();
		if let Some(path) = path {
			figment = figment.merge(Toml::file(path));
		}
		figment = figment.merge(Env::prefixed("SYNC3_"));
		Ok(figment.extract()?)
	}
}

fn default_listen() -> SocketAddr { "127.0.0.1:8808".parse().expect("valid default address") }

fn default_database_path() -> PathBuf { PathBuf::from("./sync3.db") }

fn default_upstream_poll_timeout_secs() -> u64 { 30 }

fn default_backoff_min_secs() -> u64 { 1 }

fn default_backoff_max_secs() -> u64 { 60 }

fn default_long_poll_timeout_secs() -> u64 { 30 }

fn default_idle_connection_ttl_secs() -> u64 { 30 * 60 }

fn default_max_timeline_limit() -> u32 { 100 }

fn default_log() -> String { "info".to_owned() }

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_apply_when_only_required_field_is_set() {
		let figment = Figment::new().merge(("upstream_base_url", "https://example.org"));
		let config: Config = figment.extract().expect("defaults should fill the rest");
		assert_eq!(config.listen, default_listen());
		assert_eq!(config.long_poll_timeout_secs, 30);
		assert_eq!(config.max_timeline_limit, 100);
	}

	#[test]
	fn env_overrides_file() {
		// SAFETY: single-threaded test, no other test touches this var.
		unsafe {
			std::env::set_var("SYNC3_UPSTREAM_BASE_URL", "https://env.example.org");
		}
		let config = Config::load(None).expect("env-only config should load");
		assert_eq!(config.upstream_base_url, "https://env.example.org");
		unsafe {
			std::env::remove_var("SYNC3_UPSTREAM_BASE_URL");
		}
	}
}
