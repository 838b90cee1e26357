//! §4.3 Poller & PollerMap. One long-lived upstream long-poll loop per
//! `(user, device)`, fanning results into a `DataReceiver` (the Accumulator
//! + Notifier, see `ServiceReceiver` below) and, on success only, advancing
//! the device's `since` cursor.

use std::{collections::HashMap, sync::Arc, time::Duration};

use ruma_common::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use sync3_core::{Config, Error, Result};
use tokio::{
	sync::RwLock,
	task::JoinHandle,
};

use crate::{
	accumulator::Accumulator,
	notifier::{MembershipChange, Notifier},
	store::{DeviceRecord, Event, Store},
	upstream::{JoinedRoomUpdate, UpstreamClient, typing_user_ids},
};

/// The capability set a Poller dispatches results through (§9 "Dynamic
/// dispatch": a capability-set abstraction, not an inheritance hierarchy).
#[async_trait::async_trait]
pub trait DataReceiver: Send + Sync {
	async fn initialise(&self, room_id: &OwnedRoomId, state: &[Event]) -> Result<()>;
	async fn accumulate(&self, room_id: &OwnedRoomId, timeline: &[Event]) -> Result<()>;
	async fn set_typing(&self, room_id: &OwnedRoomId, user_ids: &[OwnedUserId]) -> Result<()>;
	async fn add_to_device_messages(&self, device_id: &OwnedDeviceId, msgs: &[serde_json::Value]) -> Result<()>;
	async fn update_device_since(&self, device_id: &OwnedDeviceId, since: String) -> Result<()>;
}

/// The production `DataReceiver`: Accumulator for room state, Store
/// directly for the ancillary streams, Notifier for fanout.
pub struct ServiceReceiver {
	pub store: Arc<Store>,
	pub accumulator: Arc<Accumulator>,
	pub notifier: Arc<Notifier>,
}

#[async_trait::async_trait]
impl DataReceiver for ServiceReceiver {
	async fn initialise(&self, room_id: &OwnedRoomId, state: &[Event]) -> Result<()> {
		let result = self.accumulator.initialise(room_id, state).await?;
		if result.added {
			apply_membership_events(&self.notifier, room_id, state).await;
			self.notifier.on_new_event(room_id).await;
		}
		Ok(())
	}

	async fn accumulate(&self, room_id: &OwnedRoomId, timeline: &[Event]) -> Result<()> {
		let num_new = self.accumulator.accumulate(room_id, timeline).await?;
		if num_new > 0 {
			apply_membership_events(&self.notifier, room_id, timeline).await;
			self.notifier.on_new_event(room_id).await;
		}
		Ok(())
	}

	async fn set_typing(&self, room_id: &OwnedRoomId, user_ids: &[OwnedUserId]) -> Result<()> {
		let version_before = self.store.typing_users(room_id)?.0;
		let version_after = self.store.insert_typing_if_different(room_id, user_ids).await?;
		if version_after != version_before {
			self.notifier.on_new_event(room_id).await;
		}
		Ok(())
	}

	async fn add_to_device_messages(&self, device_id: &OwnedDeviceId, msgs: &[serde_json::Value]) -> Result<()> {
		if msgs.is_empty() {
			return Ok(());
		}
		self.store.insert_to_device(device_id, msgs).await
	}

	async fn update_device_since(&self, device_id: &OwnedDeviceId, since: String) -> Result<()> {
		self.store.update_device_since(device_id, since).await
	}
}

async fn apply_membership_events(notifier: &Notifier, room_id: &OwnedRoomId, events: &[Event]) {
	for event in events {
		let (Some(state_key), Some(membership)) = (&event.state_key, &event.membership) else { continue };
		let Ok(target) = ruma_common::OwnedUserId::try_from(state_key.as_str()) else { continue };
		let change = match membership.as_str() {
			| "join" => MembershipChange::Joined,
			| "leave" | "ban" => MembershipChange::Left,
			| _ => continue,
		};
		notifier.apply_membership(room_id, &target, change).await;
	}
}

/// One upstream long-poll loop for one `(user, device, credential)`
/// (§4.3).
pub struct Poller {
	device_id: OwnedDeviceId,
	user_id: RwLock<Option<OwnedUserId>>,
	credential: String,
	upstream: Arc<dyn UpstreamClient>,
	receiver: Arc<dyn DataReceiver>,
	store: Arc<Store>,
	poll_timeout: Duration,
	backoff_min: Duration,
	backoff_max: Duration,
}

impl Poller {
	async fn run(self: Arc<Self>) {
		if self.user_id.read().await.is_none() {
			match self.upstream.whoami(&self.credential).await {
				| Ok((user_id, _device_id)) => {
					*self.user_id.write().await = Some(user_id.clone());
					let record = self
						.store
						.get_device(&self.device_id)
						.ok()
						.flatten()
						.map(|mut r| {
							r.user_id = user_id.clone();
							r
						})
						.unwrap_or(DeviceRecord { device_id: self.device_id.clone(), user_id, since_token: None });
					if self.store.upsert_device(&record).await.is_err() {
						tracing::error!(device_id = %self.device_id, "failed to persist device record");
						return;
					}
				},
				| Err(Error::UpstreamAuth(reason)) => {
					tracing::warn!(device_id = %self.device_id, %reason, "upstream auth failed, halting poller");
					return;
				},
				| Err(e) => {
					tracing::warn!(device_id = %self.device_id, error = %e, "whoami failed, will retry");
				},
			}
		}

		let mut backoff = self.backoff_min;
		loop {
			let since = self
				.store
				.get_device(&self.device_id)
				.ok()
				.flatten()
				.and_then(|d| d.since_token);

			match self.upstream.sync(&self.credential, since.as_deref(), self.poll_timeout).await {
				| Ok(response) => {
					backoff = self.backoff_min;
					if let Err(e) = self.dispatch(response).await {
						tracing::error!(device_id = %self.device_id, error = %e, "fatal error dispatching sync batch, halting poller");
						return;
					}
				},
				| Err(Error::UpstreamAuth(reason)) => {
					tracing::warn!(device_id = %self.device_id, %reason, "upstream auth failed, halting poller");
					return;
				},
				| Err(e) => {
					tracing::warn!(device_id = %self.device_id, error = %e, backoff = ?backoff, "upstream transport error, retrying");
					tokio::time::sleep(backoff).await;
					backoff = (backoff * 2).min(self.backoff_max);
				},
			}
		}
	}

	/// Folds one upstream `/sync` response into the store, in the order
	/// §4.3 specifies: per-room state/timeline, then typing, then
	/// to-device, then (only if every prior call succeeded) the `since`
	/// advance.
	async fn dispatch(&self, response: crate::upstream::SyncResponse) -> Result<()> {
		for (room_id, update) in &response.rooms.join {
			self.dispatch_room(room_id, update).await?;
		}

		self.receiver
			.add_to_device_messages(&self.device_id, &response.to_device.events)
			.await?;

		self.receiver
			.update_device_since(&self.device_id, response.next_batch)
			.await?;

		Ok(())
	}

	async fn dispatch_room(&self, room_id: &OwnedRoomId, update: &JoinedRoomUpdate) -> Result<()> {
		if !update.state.events.is_empty() {
			let state: Vec<Event> = update.state.events.iter().map(|e| e.to_store_event(room_id)).collect();
			self.receiver.initialise(room_id, &state).await?;
		}

		if !update.timeline.events.is_empty() {
			let timeline: Vec<Event> = update.timeline.events.iter().map(|e| e.to_store_event(room_id)).collect();
			match self.receiver.accumulate(room_id, &timeline).await {
				| Ok(()) => {},
				| Err(Error::RoomNotInitialised(room)) => {
					tracing::warn!(%room, "accumulate called before initialise; dropping batch for this room");
				},
				| Err(e) => return Err(e),
			}
		}

		if let Some(typing) = typing_user_ids(&update.ephemeral) {
			self.receiver.set_typing(room_id, &typing).await?;
		}

		Ok(())
	}
}

/// A set of Pollers keyed by `device_id`. `ensure_polling` is idempotent —
/// the second caller for a device joins the existing Poller rather than
/// starting a duplicate (§4.3).
pub struct PollerMap {
	config: PollerConfig,
	pollers: RwLock<HashMap<OwnedDeviceId, (Arc<Poller>, JoinHandle<()>)>>,
}

struct PollerConfig {
	poll_timeout: Duration,
	backoff_min: Duration,
	backoff_max: Duration,
}

impl PollerMap {
	#[must_use]
	pub fn new(config: &Config) -> Arc<Self> {
		Arc::new(Self {
			config: PollerConfig {
				poll_timeout: Duration::from_secs(config.upstream_poll_timeout_secs),
				backoff_min: Duration::from_secs(config.backoff_min_secs),
				backoff_max: Duration::from_secs(config.backoff_max_secs),
			},
			pollers: RwLock::new(HashMap::new()),
		})
	}

	/// Idempotent: the second caller for a `device_id` joins the existing
	/// Poller, never starts a duplicate.
	pub async fn ensure_polling(
		&self,
		device_id: OwnedDeviceId,
		credential: String,
		upstream: Arc<dyn UpstreamClient>,
		receiver: Arc<dyn DataReceiver>,
		store: Arc<Store>,
	) {
		{
			let pollers = self.pollers.read().await;
			if pollers.contains_key(&device_id) {
				return;
			}
		}

		let mut pollers = self.pollers.write().await;
		if pollers.contains_key(&device_id) {
			return;
		}

		let poller = Arc::new(Poller {
			device_id: device_id.clone(),
			user_id: RwLock::new(None),
			credential,
			upstream,
			receiver,
			store,
			poll_timeout: self.config.poll_timeout,
			backoff_min: self.config.backoff_min,
			backoff_max: self.config.backoff_max,
		});

		let task_poller = poller.clone();
		let handle = tokio::spawn(async move { task_poller.run().await });
		pollers.insert(device_id, (poller, handle));
	}

	/// Explicit shutdown: the only time a Poller is ever removed (§4.3).
	pub async fn shutdown(&self, device_id: &OwnedDeviceId) {
		if let Some((_, handle)) = self.pollers.write().await.remove(device_id) {
			handle.abort();
		}
	}

	pub async fn shutdown_all(&self) {
		let mut pollers = self.pollers.write().await;
		for (_, (_, handle)) in pollers.drain() {
			handle.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{
		sync::atomic::{AtomicUsize, Ordering as AtomicOrdering},
		time::Duration,
	};

	use ruma_common::{OwnedDeviceId, OwnedUserId};
	use sync3_core::Result;
	use tokio::sync::Mutex as AsyncMutex;

	use super::*;
	use crate::upstream::{JoinedRoomUpdate, Rooms, StateBlock, SyncResponse, Timeline, ToDevice, UpstreamClient};

	/// Drives a Poller through a fixed sequence of `sync` responses without
	/// a network, per SPEC_FULL.md §4.3's addendum.
	struct FakeUpstream {
		batches: AsyncMutex<Vec<SyncResponse>>,
		calls: AtomicUsize,
	}

	#[async_trait::async_trait]
	impl UpstreamClient for FakeUpstream {
		async fn whoami(&self, _credential: &str) -> Result<(OwnedUserId, OwnedDeviceId)> {
			Ok(("@me:example.org".try_into().unwrap(), "DEVICE".try_into().unwrap()))
		}

		async fn sync(&self, _credential: &str, _since: Option<&str>, _timeout: Duration) -> Result<SyncResponse> {
			self.calls.fetch_add(1, AtomicOrdering::SeqCst);
			let mut batches = self.batches.lock().await;
			if batches.is_empty() {
				// stall forever once fixtures are exhausted, as a real
				// upstream long-poll would if nothing changes.
				std::future::pending::<()>().await;
				unreachable!();
			}
			Ok(batches.remove(0))
		}
	}

	fn raw_event(id: &str, kind: &str, sender: &str, state_key: Option<&str>, content: serde_json::Value) -> crate::upstream::RawEvent {
		crate::upstream::RawEvent {
			event_id: id.try_into().unwrap(),
			kind: kind.to_owned(),
			sender: sender.try_into().unwrap(),
			state_key: state_key.map(ToOwned::to_owned),
			content,
		}
	}

	async fn open_tmp() -> Arc<Store> {
		let dir = tempfile::tempdir().unwrap();
		// leak the tempdir for the lifetime of the test process; fine for tests.
		let path = Box::leak(Box::new(dir)).path().to_path_buf();
		Store::open(&path).unwrap()
	}

	#[tokio::test]
	async fn dispatch_initialises_then_accumulates_and_advances_since() {
		let store = open_tmp().await;
		let accumulator = Accumulator::new(store.clone());
		let notifier = Notifier::new(store.clone()).await.unwrap();
		let receiver = Arc::new(ServiceReceiver { store: store.clone(), accumulator, notifier });

		let create = raw_event("$a", "m.room.create", "@me:example.org", Some(""), serde_json::json!({}));
		let join = raw_event(
			"$b",
			"m.room.member",
			"@me:example.org",
			Some("@me:example.org"),
			serde_json::json!({"membership": "join"}),
		);
		let message = raw_event("$g", "m.room.message", "@me:example.org", None, serde_json::json!({"body": "hi"}));

		let room_id: ruma_common::OwnedRoomId = <&ruma_common::RoomId>::try_from("!r:example.org").unwrap().to_owned();
		let mut join_update = JoinedRoomUpdate::default();
		join_update.state = StateBlock { events: vec![create, join] };

		let mut rooms = Rooms::default();
		rooms.join.insert(room_id.clone(), join_update);
		let batch1 = SyncResponse { rooms, to_device: ToDevice::default(), next_batch: "since1".to_owned() };

		let mut timeline_update = JoinedRoomUpdate::default();
		timeline_update.timeline = Timeline { events: vec![message] };
		let mut rooms2 = Rooms::default();
		rooms2.join.insert(room_id.clone(), timeline_update);
		let batch2 = SyncResponse { rooms: rooms2, to_device: ToDevice::default(), next_batch: "since2".to_owned() };

		let upstream = Arc::new(FakeUpstream { batches: AsyncMutex::new(vec![batch1, batch2]), calls: AtomicUsize::new(0) });

		let poller = Arc::new(Poller {
			device_id: "DEVICE".try_into().unwrap(),
			user_id: RwLock::new(None),
			credential: "tok".to_owned(),
			upstream: upstream.clone(),
			receiver,
			store: store.clone(),
			poll_timeout: Duration::from_secs(1),
			backoff_min: Duration::from_millis(1),
			backoff_max: Duration::from_millis(10),
		});

		let task = tokio::spawn(poller.clone().run());
		tokio::time::sleep(Duration::from_millis(50)).await;
		task.abort();

		assert!(store.current_snapshot(&room_id).unwrap().is_some());
		let device = store.get_device(&"DEVICE".try_into().unwrap()).unwrap().unwrap();
		assert_eq!(device.since_token.as_deref(), Some("since2"));
	}
}
