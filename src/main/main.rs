//! Binary entry point: load config, wire the services, serve `/sync` until
//! a shutdown signal arrives. Simplified from the teacher's own
//! `main`/`server` split — no process restart, no hot-reload modules, no
//! sentry/flamegraph guards (SPEC_FULL.md §9: none of those have a
//! counterpart in this proxy's scope).

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use sync3_core::{Config, Result};
use sync3_service::Services;

/// Sliding-sync proxy: converts upstream long-poll sync into a windowed,
/// list-oriented sliding-sync protocol.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
	/// Path to a TOML config file. Overridable per-field by `SYNC3_*`
	/// environment variables (see `sync3_core::config::Config::load`).
	#[arg(short, long, env = "SYNC3_CONFIG")]
	config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();
	let config = Config::load(args.config.as_deref())?;
	sync3_core::log::init(&config)?;

	tracing::info!(listen = %config.listen, upstream = %config.upstream_base_url, "starting sync3");

	let services = Services::build(&config).await?;
	spawn_idle_eviction(services.clone(), config.idle_connection_ttl_secs);

	let app = sync3_api::router(services.clone());
	let listener = tokio::net::TcpListener::bind(config.listen).await?;

	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await?;

	tracing::info!("sync3 shut down cleanly");
	services.pollers.shutdown_all().await;
	Ok(())
}

/// Periodically sweeps the Notifier for Connections idle past their TTL
/// (§5 "Idle Connection eviction").
fn spawn_idle_eviction(services: std::sync::Arc<Services>, ttl_secs: u64) {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(Duration::from_secs(60).min(Duration::from_secs(ttl_secs.max(1))));
		loop {
			interval.tick().await;
			services.notifier.evict_idle(ttl_secs).await;
		}
	});
}

async fn shutdown_signal() {
	let ctrl_c = async {
		tokio::signal::ctrl_c()
			.await
			.expect("failed to install Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}

	tracing::info!("shutdown signal received");
}
