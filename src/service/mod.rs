//! Accumulator / Poller / Notifier / Connection — the four components that
//! sit on top of the Store (§4.2–§4.5 of the spec), plus the Store itself.

pub mod accumulator;
pub mod connection;
pub mod list;
pub mod notifier;
pub mod poller;
pub mod store;
pub mod upstream;

use std::sync::Arc;

use sync3_core::{Config, Result};

pub use self::{
	accumulator::Accumulator,
	connection::{ConnId, Connection},
	notifier::Notifier,
	poller::PollerMap,
	store::Store,
};
use self::{
	poller::{DataReceiver, ServiceReceiver},
	upstream::{HttpUpstreamClient, UpstreamClient},
};

/// The wired-up set of long-lived services a running proxy needs, built
/// once at startup and handed to the HTTP layer. Mirrors the teacher's own
/// `tuwunel_service::Services` aggregate.
pub struct Services {
	pub config: Config,
	pub store: Arc<Store>,
	pub accumulator: Arc<Accumulator>,
	pub notifier: Arc<Notifier>,
	pub pollers: Arc<PollerMap>,
	pub upstream: Arc<dyn UpstreamClient>,
	pub receiver: Arc<dyn DataReceiver>,
}

impl Services {
	pub async fn build(config: &Config) -> Result<Arc<Self>> {
		let store = Store::open(&config.database_path)?;
		let accumulator = Accumulator::new(store.clone());
		let notifier = Notifier::new(store.clone()).await?;
		let pollers = PollerMap::new(config);
		let upstream: Arc<dyn UpstreamClient> = Arc::new(HttpUpstreamClient::new(config.upstream_base_url.clone()));
		let receiver: Arc<dyn DataReceiver> =
			Arc::new(ServiceReceiver { store: store.clone(), accumulator: accumulator.clone(), notifier: notifier.clone() });

		Ok(Arc::new(Self { config: config.clone(), store, accumulator, notifier, pollers, upstream, receiver }))
	}
}
