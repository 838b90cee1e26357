//! §6 "Upstream sync client". Two calls only: `WhoAmI` and `Sync`,
//! deserialized as a minimal bespoke subset of the Matrix Client-Server
//! `/sync` response (`rooms.join`, `to_device`, `next_batch`) — we are a
//! client of that protocol here, not implementing it, so this does not pull
//! in Ruma's client-API request/response crate (SPEC_FULL.md §6).

use std::{collections::BTreeMap, time::Duration};

use ruma_common::{OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::Deserialize;
use sync3_core::{Error, Result};

use crate::store::Event;

/// Raw upstream event shape, close enough to the wire to deserialize
/// directly; converted into `store::Event` by `to_store_event`.
#[derive(Clone, Debug, Deserialize)]
pub struct RawEvent {
	pub event_id: OwnedEventId,
	#[serde(rename = "type")]
	pub kind: String,
	pub sender: OwnedUserId,
	#[serde(default)]
	pub state_key: Option<String>,
	#[serde(default)]
	pub content: serde_json::Value,
}

impl RawEvent {
	/// Folds this raw upstream event into the Store's typed `Event`,
	/// deriving `membership` from `content.membership` for
	/// `m.room.member` state events (§3 "Event" derived fields).
	#[must_use]
	pub fn to_store_event(&self, room_id: &OwnedRoomId) -> Event {
		let membership = (self.kind == "m.room.member")
			.then(|| self.content.get("membership").and_then(serde_json::Value::as_str))
			.flatten()
			.map(ToOwned::to_owned);

		Event {
			event_id: self.event_id.clone(),
			room_id: room_id.clone(),
			kind: self.kind.clone(),
			sender: self.sender.clone(),
			state_key: self.state_key.clone(),
			membership,
			content: self.content.clone(),
		}
	}
}

#[derive(Default, Deserialize)]
pub struct Timeline {
	#[serde(default)]
	pub events: Vec<RawEvent>,
}

#[derive(Default, Deserialize)]
pub struct StateBlock {
	#[serde(default)]
	pub events: Vec<RawEvent>,
}

#[derive(Default, Deserialize)]
pub struct Ephemeral {
	#[serde(default)]
	pub events: Vec<serde_json::Value>,
}

/// A single room's slice of the `rooms.join` object. `state.events` is
/// non-empty only on the batch that first reports the room — that is what
/// `Poller` uses to decide `Initialise` vs `Accumulate` (§4.3).
#[derive(Default, Deserialize)]
pub struct JoinedRoomUpdate {
	#[serde(default)]
	pub state: StateBlock,
	#[serde(default)]
	pub timeline: Timeline,
	#[serde(default)]
	pub ephemeral: Ephemeral,
}

#[derive(Default, Deserialize)]
pub struct Rooms {
	#[serde(default)]
	pub join: BTreeMap<OwnedRoomId, JoinedRoomUpdate>,
}

#[derive(Deserialize)]
pub struct SyncResponse {
	#[serde(default)]
	pub rooms: Rooms,
	#[serde(default)]
	pub to_device: ToDevice,
	pub next_batch: String,
}

#[derive(Default, Deserialize)]
pub struct ToDevice {
	#[serde(default)]
	pub events: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct WhoAmIResponse {
	user_id: OwnedUserId,
	device_id: OwnedDeviceId,
}

/// Extracts a room's typing user list from an `ephemeral` block's
/// `m.typing` event, if present.
#[must_use]
pub fn typing_user_ids(ephemeral: &Ephemeral) -> Option<Vec<OwnedUserId>> {
	ephemeral
		.events
		.iter()
		.find(|e| e.get("type").and_then(serde_json::Value::as_str) == Some("m.typing"))
		.and_then(|e| e.get("content")?.get("user_ids"))
		.and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// The two upstream calls the Poller consumes (§6). A trait so the Poller
/// can be driven in tests by a fake in-memory implementation without a
/// network.
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
	/// Returns `(user_id, device_id)` — the real `/account/whoami` response
	/// this proxy consumes identifies both, which is how a Poller learns
	/// its `device_id` without a separate endpoint.
	async fn whoami(&self, credential: &str) -> Result<(OwnedUserId, OwnedDeviceId)>;

	async fn sync(&self, credential: &str, since: Option<&str>, timeout: Duration) -> Result<SyncResponse>;
}

/// `reqwest`-backed implementation against a real upstream homeserver.
pub struct HttpUpstreamClient {
	http: reqwest::Client,
	base_url: String,
}

impl HttpUpstreamClient {
	#[must_use]
	pub fn new(base_url: String) -> Self {
		Self { http: reqwest::Client::new(), base_url }
	}
}

#[async_trait::async_trait]
impl UpstreamClient for HttpUpstreamClient {
	async fn whoami(&self, credential: &str) -> Result<(OwnedUserId, OwnedDeviceId)> {
		let url = format!("{}/_matrix/client/v3/account/whoami", self.base_url);
		let resp = self
			.http
			.get(url)
			.bearer_auth(credential)
			.send()
			.await
			.map_err(|e| Error::UpstreamTransport(e.to_string().into()))?;

		if resp.status() == reqwest::StatusCode::UNAUTHORIZED || resp.status() == reqwest::StatusCode::FORBIDDEN {
			return Err(Error::UpstreamAuth("upstream rejected credential".into()));
		}
		let body: WhoAmIResponse = resp
			.error_for_status()
			.map_err(|e| Error::UpstreamTransport(e.to_string().into()))?
			.json()
			.await
			.map_err(|e| Error::UpstreamTransport(e.to_string().into()))?;
		Ok((body.user_id, body.device_id))
	}

	async fn sync(&self, credential: &str, since: Option<&str>, timeout: Duration) -> Result<SyncResponse> {
		let mut url = format!(
			"{}/_matrix/client/v3/sync?timeout={}",
			self.base_url,
			timeout.as_millis()
		);
		if let Some(since) = since {
			url.push_str("&since=");
			url.push_str(since);
		}

		let resp = self
			.http
			.get(url)
			.bearer_auth(credential)
			.timeout(timeout + Duration::from_secs(10))
			.send()
			.await
			.map_err(|e| Error::UpstreamTransport(e.to_string().into()))?;

		if resp.status() == reqwest::StatusCode::UNAUTHORIZED || resp.status() == reqwest::StatusCode::FORBIDDEN {
			return Err(Error::UpstreamAuth("upstream rejected credential".into()));
		}

		resp.error_for_status()
			.map_err(|e| Error::UpstreamTransport(e.to_string().into()))?
			.json()
			.await
			.map_err(|e| Error::UpstreamTransport(e.to_string().into()))
	}
}
