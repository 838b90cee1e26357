//! §4.2 Accumulator. Thin orchestration on top of `Store`'s already-atomic
//! `initialise_room` / `accumulate_room` helpers: this layer's job is to
//! translate their return values into the `(added, num_new)` / `num_new`
//! contracts §4.2 specifies and to fan successful writes out to the
//! `Notifier` (wired in by the Poller, see `PollerMap::ensure_polling`).

use std::sync::Arc;

use ruma_common::OwnedRoomId;
use sync3_core::Result;

use crate::store::{Event, Store};

/// Result of `Accumulator::initialise`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Initialised {
	pub added: bool,
	pub num_new: usize,
}

/// Folds upstream state/timeline batches into the `Store`. Both entry
/// points are idempotent by construction (§4.2): re-running either with
/// data already on disk is a guaranteed no-op, never a duplicate write.
pub struct Accumulator {
	store: Arc<Store>,
}

impl Accumulator {
	#[must_use]
	pub fn new(store: Arc<Store>) -> Arc<Self> { Arc::new(Self { store }) }

	/// Called when upstream reports a room for the first time. A second
	/// call for a room that already has a current snapshot is a no-op
	/// (duplicate first-sync) and returns `added: false`.
	pub async fn initialise(&self, room_id: &OwnedRoomId, state_events: &[Event]) -> Result<Initialised> {
		match self.store.initialise_room(room_id, state_events).await? {
			| Some((nids, _snap_id)) => {
				tracing::debug!(%room_id, nids = nids.len(), "room initialised");
				Ok(Initialised { added: true, num_new: state_events.len() })
			},
			| None => Ok(Initialised { added: false, num_new: 0 }),
		}
	}

	/// Called for each batch of live/timeline events. `num_new == 0` is a
	/// valid no-op (duplicate batch, network retry). Fails with
	/// `Error::RoomNotInitialised` if upstream has not sent a state block
	/// for this room yet — fatal to the current batch, not to the poller.
	pub async fn accumulate(&self, room_id: &OwnedRoomId, timeline_events: &[Event]) -> Result<usize> {
		let (nids, num_new, new_snapshot) = self.store.accumulate_room(room_id, timeline_events).await?;
		if num_new > 0 {
			tracing::debug!(
				%room_id,
				num_new,
				new_snapshot = new_snapshot.is_some(),
				last_nid = nids.last().copied(),
				"accumulated timeline batch"
			);
		}
		Ok(num_new)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use ruma_common::RoomId;

	use super::*;

	fn ev(id: &str, room: &str, kind: &str, sender: &str, state_key: Option<&str>, membership: Option<&str>) -> Event {
		Event {
			event_id: id.try_into().unwrap(),
			room_id: <&RoomId>::try_from(room).unwrap().to_owned(),
			kind: kind.to_owned(),
			sender: sender.try_into().unwrap(),
			state_key: state_key.map(ToOwned::to_owned),
			membership: membership.map(ToOwned::to_owned),
			content: serde_json::json!({}),
		}
	}

	async fn open_tmp() -> Arc<Store> {
		let dir = tempfile::tempdir().unwrap();
		let path = Box::leak(Box::new(dir)).path().to_path_buf();
		Store::open(&path).unwrap()
	}

	#[tokio::test]
	async fn initialise_is_idempotent() {
		let store = open_tmp().await;
		let acc = Accumulator::new(store);
		let room: OwnedRoomId = <&RoomId>::try_from("!r:example.org").unwrap().to_owned();
		let create = ev("$a", "!r:example.org", "m.room.create", "@me:example.org", Some(""), None);

		let first = acc.initialise(&room, &[create.clone()]).await.unwrap();
		assert!(first.added);

		let second = acc.initialise(&room, &[create]).await.unwrap();
		assert!(!second.added);
	}

	#[tokio::test]
	async fn accumulate_without_initialise_fails() {
		let store = open_tmp().await;
		let acc = Accumulator::new(store);
		let room: OwnedRoomId = <&RoomId>::try_from("!r:example.org").unwrap().to_owned();
		let msg = ev("$g", "!r:example.org", "m.room.message", "@me:example.org", None, None);

		let err = acc.accumulate(&room, &[msg]).await.unwrap_err();
		assert!(matches!(err, sync3_core::Error::RoomNotInitialised(_)));
	}

	#[tokio::test]
	async fn duplicate_batch_is_a_no_op() {
		let store = open_tmp().await;
		let acc = Accumulator::new(store);
		let room: OwnedRoomId = <&RoomId>::try_from("!r:example.org").unwrap().to_owned();
		let create = ev("$a", "!r:example.org", "m.room.create", "@me:example.org", Some(""), None);
		acc.initialise(&room, &[create]).await.unwrap();

		let msg = ev("$g", "!r:example.org", "m.room.message", "@me:example.org", None, None);
		let first = acc.accumulate(&room, &[msg.clone()]).await.unwrap();
		assert_eq!(first, 1);

		let second = acc.accumulate(&room, &[msg]).await.unwrap();
		assert_eq!(second, 0);
	}
}
