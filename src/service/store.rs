//! §4.1 Store. Transactional-enough CRUD over the generic column-family
//! engine in `sync3-database`: one write mutex serializes mutating calls (no
//! conflicts to retry because there is only ever one writer — see
//! SPEC_FULL.md §4.1), reads for a single HTTP response go through one
//! RocksDB snapshot.

use std::{
	collections::{BTreeMap, BTreeSet},
	path::Path,
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
};

use ruma_common::{OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use sync3_core::{Error, Nid, Result, SnapshotId, ids::EVENTS_START};
use sync3_database::{Batch, Engine, Map};
use tokio::sync::Mutex as AsyncMutex;

const COLUMNS: &[&str] = &[
	"event_id_to_nid",
	"event_by_nid",
	"room_events",
	"snapshot_nids",
	"snapshot_refcount",
	"room_current_snapshot",
	"membership_log",
	"membership_latest",
	"devices",
	"todevice",
	"typing",
	"meta",
];

const META_TODEVICE_SEQ: &[u8] = b"todevice_seq";

/// A single folded-in event, cached derived fields alongside the opaque
/// upstream JSON (§3 "Event").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
	pub event_id: OwnedEventId,
	pub room_id: OwnedRoomId,
	#[serde(rename = "type")]
	pub kind: String,
	pub sender: OwnedUserId,
	pub state_key: Option<String>,
	pub membership: Option<String>,
	pub content: serde_json::Value,
}

impl Event {
	#[must_use]
	pub fn is_state(&self) -> bool { self.state_key.is_some() }

	/// `(type, state_key)` — the slot a state event occupies in a snapshot
	/// (§4.2 "clobber by slot").
	#[must_use]
	pub fn slot(&self) -> Option<(String, String)> {
		self.state_key
			.clone()
			.map(|sk| (self.kind.clone(), sk))
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceRecord {
	pub device_id: ruma_common::OwnedDeviceId,
	pub user_id: OwnedUserId,
	pub since_token: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct TypingRow {
	version: u64,
	users: Vec<OwnedUserId>,
}

pub struct Store {
	engine: Arc<Engine>,
	event_id_to_nid: Arc<Map>,
	event_by_nid: Arc<Map>,
	room_events: Arc<Map>,
	snapshot_nids: Arc<Map>,
	snapshot_refcount: Arc<Map>,
	room_current_snapshot: Arc<Map>,
	membership_log: Arc<Map>,
	membership_latest: Arc<Map>,
	devices: Arc<Map>,
	todevice: Arc<Map>,
	typing: Arc<Map>,
	meta: Arc<Map>,

	nid_seq: AtomicU64,
	snapshot_seq: AtomicU64,
	todevice_seq: AtomicU64,

	/// Serializes every mutating operation. See module docs: because the
	/// caller already serializes per-room work (one poller per device, one
	/// device's timeline owned by one sync loop at a time), this one mutex
	/// is sufficient for "serializable isolation" without needing RocksDB's
	/// own transactional DB variant.
	write_lock: AsyncMutex<()>,
}

impl Store {
	pub fn open(path: &Path) -> Result<Arc<Self>> {
		let engine = Engine::open(path, COLUMNS)?;
		let open = |name: &'static str| Map::open(&engine, name);

		let event_by_nid = open("event_by_nid");
		let snapshot_nids = open("snapshot_nids");
		let todevice = open("todevice");
		let meta = open("meta");

		let nid_seq = AtomicU64::new(highest_be_key(&event_by_nid).map_or(0, |n| n + 1));
		let snapshot_seq = AtomicU64::new(highest_be_key(&snapshot_nids).map_or(0, |n| n + 1));
		let todevice_seq = AtomicU64::new(
			meta.get(META_TODEVICE_SEQ)?
				.map_or(0, |v| be_to_u64(&v)),
		);

		Ok(Arc::new(Self {
			event_id_to_nid: open("event_id_to_nid"),
			event_by_nid,
			room_events: open("room_events"),
			snapshot_nids,
			snapshot_refcount: open("snapshot_refcount"),
			room_current_snapshot: open("room_current_snapshot"),
			membership_log: open("membership_log"),
			membership_latest: open("membership_latest"),
			devices: open("devices"),
			todevice,
			typing: open("typing"),
			meta,
			nid_seq,
			snapshot_seq,
			todevice_seq,
			write_lock: AsyncMutex::new(()),
			engine,
		}))
	}

	// ---- InsertEvents -------------------------------------------------

	/// Deduplicates by `event_id` (existing rows keep their NID). Returns
	/// the NIDs 1:1 with `events` and the count of genuinely new rows.
	pub async fn insert_events(&self, events: &[Event]) -> Result<(Vec<Nid>, usize)> {
		let _guard = self.write_lock.lock().await;
		self.insert_events_locked(events)
	}

	fn insert_events_locked(&self, events: &[Event]) -> Result<(Vec<Nid>, usize)> {
		let mut nids = Vec::with_capacity(events.len());
		let mut num_new = 0;
		let mut batch = Batch::new();

		// Tracks each target user's most-recently-seen membership value
		// within this batch, seeded lazily from the store so a run of
		// membership events for the same (room, user) in one batch is
		// compared against the right predecessor even before `batch` is
		// committed.
		let mut latest_cache: BTreeMap<Vec<u8>, Option<String>> = BTreeMap::new();

		for event in events {
			if let Some(existing) = self.event_id_to_nid.get(event.event_id.as_bytes())? {
				nids.push(be_to_u64(&existing));
				continue;
			}

			let nid = self.nid_seq.fetch_add(1, Ordering::SeqCst);
			let key = u64_to_be(nid);

			self.event_id_to_nid
				.batch_put(&mut batch, event.event_id.as_bytes(), key);
			self.event_by_nid.batch_put(
				&mut batch,
				key,
				serde_json::to_vec(event).map_err(Error::from)?,
			);
			self.room_events
				.batch_put(&mut batch, room_events_key(&event.room_id, nid), []);

			if let Some(membership) = &event.membership {
				if let Some(state_key) = &event.state_key {
					let latest_key = membership_log_prefix(&event.room_id, state_key);
					let previous = match latest_cache.get(&latest_key) {
						| Some(value) => value.clone(),
						| None => self
							.membership_latest
							.get(latest_key.clone())?
							.map(|raw| String::from_utf8_lossy(&raw).into_owned()),
					};

					// Only a real membership transition (join -> leave,
					// invite -> join, ...) is logged; a membership event
					// that merely restates the same membership (e.g. a
					// profile/displayname change) is not (spec.md §8
					// scenario 3).
					if previous.as_deref() != Some(membership.as_str()) {
						self.membership_log.batch_put(
							&mut batch,
							membership_log_key(&event.room_id, state_key, nid),
							membership.as_bytes(),
						);
						self.membership_latest
							.batch_put(&mut batch, latest_key.clone(), membership.as_bytes());
					}

					latest_cache.insert(latest_key, Some(membership.clone()));
				}
			}

			nids.push(nid);
			num_new += 1;
		}

		self.engine.commit(batch)?;
		Ok((nids, num_new))
	}

	// ---- CreateSnapshot / SetCurrentSnapshot --------------------------

	pub async fn create_snapshot(&self, event_nids: &BTreeSet<Nid>) -> Result<SnapshotId> {
		let _guard = self.write_lock.lock().await;
		let snap_id = self.snapshot_seq.fetch_add(1, Ordering::SeqCst);
		let nids: Vec<Nid> = event_nids.iter().copied().collect();
		self.snapshot_nids
			.put(u64_to_be(snap_id), serde_json::to_vec(&nids).map_err(Error::from)?)?;
		self.snapshot_refcount
			.put(u64_to_be(snap_id), u64_to_be(0))?;
		Ok(snap_id)
	}

	/// Atomically: increments `new_snap_id`'s ref-count, reads the previous
	/// current snapshot (if any), decrements its ref-count, replaces the
	/// pointer.
	pub async fn set_current_snapshot(&self, room_id: &OwnedRoomId, new_snap_id: SnapshotId) -> Result<()> {
		let _guard = self.write_lock.lock().await;
		self.set_current_snapshot_locked(room_id, new_snap_id)
	}

	fn set_current_snapshot_locked(&self, room_id: &OwnedRoomId, new_snap_id: SnapshotId) -> Result<()> {
		self.bump_refcount(new_snap_id, 1)?;

		let previous = self
			.room_current_snapshot
			.get(room_id.as_bytes())?
			.map(|v| be_to_u64(&v));

		if let Some(previous) = previous {
			self.bump_refcount(previous, -1)?;
		}

		self.room_current_snapshot
			.put(room_id.as_bytes(), u64_to_be(new_snap_id))?;
		Ok(())
	}

	fn bump_refcount(&self, snap_id: SnapshotId, delta: i64) -> Result<()> {
		let current = self
			.snapshot_refcount
			.get(u64_to_be(snap_id))?
			.map_or(0, |v| be_to_u64(&v));
		let next = current.saturating_add_signed(delta);
		self.snapshot_refcount
			.put(u64_to_be(snap_id), u64_to_be(next))
	}

	pub fn current_snapshot(&self, room_id: &OwnedRoomId) -> Result<Option<SnapshotId>> {
		Ok(self
			.room_current_snapshot
			.get(room_id.as_bytes())?
			.map(|v| be_to_u64(&v)))
	}

	pub fn snapshot_nids(&self, snap_id: SnapshotId) -> Result<BTreeSet<Nid>> {
		let raw = self
			.snapshot_nids
			.get(u64_to_be(snap_id))?
			.ok_or_else(|| Error::Store("snapshot not found".into()))?;
		let nids: Vec<Nid> = serde_json::from_slice(&raw).map_err(Error::from)?;
		Ok(nids.into_iter().collect())
	}

	pub fn snapshot_refcount(&self, snap_id: SnapshotId) -> Result<u64> {
		Ok(self
			.snapshot_refcount
			.get(u64_to_be(snap_id))?
			.map_or(0, |v| be_to_u64(&v)))
	}

	// ---- Initialise / Accumulate helpers (used by Accumulator) --------

	/// Runs `insert_events` + `create_snapshot` + `set_current_snapshot`
	/// atomically under one write-lock hold, so the Accumulator never
	/// observes a half-applied `Initialise`.
	pub async fn initialise_room(
		&self,
		room_id: &OwnedRoomId,
		events: &[Event],
	) -> Result<Option<(Vec<Nid>, SnapshotId)>> {
		let _guard = self.write_lock.lock().await;
		if self.current_snapshot(room_id)?.is_some() {
			return Ok(None);
		}

		let (nids, _) = self.insert_events_locked(events)?;
		let snap_id = {
			let id = self.snapshot_seq.fetch_add(1, Ordering::SeqCst);
			let set: BTreeSet<Nid> = nids.iter().copied().collect();
			self.snapshot_nids
				.put(u64_to_be(id), serde_json::to_vec(&set).map_err(Error::from)?)?;
			self.snapshot_refcount.put(u64_to_be(id), u64_to_be(0))?;
			id
		};
		self.set_current_snapshot_locked(room_id, snap_id)?;
		Ok(Some((nids, snap_id)))
	}

	/// Inserts a timeline batch and, if it contains state events, folds
	/// them into a new snapshot by `(type, state_key)` slot. Returns
	/// `(nids, num_new, new_current_snapshot)`.
	pub async fn accumulate_room(
		&self,
		room_id: &OwnedRoomId,
		events: &[Event],
	) -> Result<(Vec<Nid>, usize, Option<SnapshotId>)> {
		let _guard = self.write_lock.lock().await;

		let (nids, num_new) = self.insert_events_locked(events)?;
		if num_new == 0 {
			return Ok((nids, 0, None));
		}

		let current = self
			.current_snapshot(room_id)?
			.ok_or_else(|| Error::RoomNotInitialised(room_id.clone()))?;

		let mut state: BTreeSet<Nid> = self.snapshot_nids(current)?;
		let mut by_slot: BTreeMap<(String, String), Nid> = BTreeMap::new();

		// index the current snapshot's own state events by slot so a new
		// state event can clobber one already present before this batch.
		for &nid in &state {
			if let Some(event) = self.event_by_nid(nid)? {
				if let Some(slot) = event.slot() {
					by_slot.insert(slot, nid);
				}
			}
		}

		let mut modified = false;
		for (event, &nid) in events.iter().zip(nids.iter()) {
			let Some(slot) = event.slot() else { continue };
			if let Some(old_nid) = by_slot.insert(slot, nid) {
				state.remove(&old_nid);
			}
			state.insert(nid);
			modified = true;
		}

		if !modified {
			return Ok((nids, num_new, None));
		}

		let snap_id = self.snapshot_seq.fetch_add(1, Ordering::SeqCst);
		self.snapshot_nids
			.put(u64_to_be(snap_id), serde_json::to_vec(&state).map_err(Error::from)?)?;
		self.snapshot_refcount
			.put(u64_to_be(snap_id), u64_to_be(0))?;
		self.set_current_snapshot_locked(room_id, snap_id)?;

		Ok((nids, num_new, Some(snap_id)))
	}

	pub fn event_by_nid(&self, nid: Nid) -> Result<Option<Event>> {
		self.event_by_nid
			.get(u64_to_be(nid))?
			.map(|raw| serde_json::from_slice(&raw).map_err(Error::from))
			.transpose()
	}

	// ---- Delta ---------------------------------------------------------

	/// Up to `limit` events with `NID > from_excl AND room_id = room_id`,
	/// ascending. `new_pos` is the last NID returned, or `from_excl` if
	/// none.
	pub fn delta(&self, room_id: &OwnedRoomId, from_excl: Nid, limit: usize) -> Result<(Vec<Event>, Nid)> {
		let prefix = room_id_prefix(room_id);
		let mut events = Vec::new();
		let mut new_pos = from_excl;

		for (key, _) in self.room_events.iter_prefix(&prefix) {
			let nid = nid_from_room_events_key(&key, prefix.len());
			if nid <= from_excl {
				continue;
			}
			if events.len() >= limit {
				break;
			}
			if let Some(event) = self.event_by_nid(nid)? {
				new_pos = nid;
				events.push(event);
			}
		}

		Ok((events, new_pos))
	}

	/// Up to `limit` most-recent events in the room, descending by NID —
	/// used by the Connection to assemble a bounded timeline (§4.5).
	pub fn latest_events(&self, room_id: &OwnedRoomId, limit: usize) -> Result<Vec<Event>> {
		if limit == 0 {
			return Ok(Vec::new());
		}
		let prefix = room_id_prefix(room_id);
		let mut nids: Vec<Nid> = self
			.room_events
			.iter_prefix(&prefix)
			.map(|(key, _)| nid_from_room_events_key(&key, prefix.len()))
			.collect();
		nids.sort_unstable();
		nids.reverse();
		nids.truncate(limit);
		nids.reverse();

		nids.into_iter()
			.filter_map(|nid| self.event_by_nid(nid).transpose())
			.collect()
	}

	/// The highest NID among events ever folded into this room, i.e. its
	/// "most recent activity" rank key (§4.5 room ordering).
	pub fn latest_nid(&self, room_id: &OwnedRoomId) -> Result<Nid> {
		let prefix = room_id_prefix(room_id);
		Ok(self
			.room_events
			.iter_prefix(&prefix)
			.map(|(key, _)| nid_from_room_events_key(&key, prefix.len()))
			.max()
			.unwrap_or(EVENTS_START))
	}

	// ---- AllJoinedMembers ----------------------------------------------

	/// Computed from the current snapshot of every room, filtered to
	/// `membership = "join"`. Called once at process startup to seed the
	/// Notifier.
	pub fn all_joined_members(&self) -> Result<BTreeMap<OwnedRoomId, Vec<OwnedUserId>>> {
		let mut out = BTreeMap::new();
		for (room_key, snap_key) in self.room_current_snapshot.iter() {
			let room_id: OwnedRoomId = std::str::from_utf8(&room_key)
				.map_err(|e| Error::Store(e.to_string().into()))?
				.try_into()
				.map_err(|_| Error::Store("invalid room_id in store".into()))?;
			let snap_id = be_to_u64(&snap_key);

			let mut joined = Vec::new();
			for nid in self.snapshot_nids(snap_id)? {
				if let Some(event) = self.event_by_nid(nid)? {
					if event.membership.as_deref() == Some("join") {
						if let Some(state_key) = &event.state_key {
							if let Ok(user_id) = OwnedUserId::try_from(state_key.as_str()) {
								joined.push(user_id);
							}
						}
					}
				}
			}
			out.insert(room_id, joined);
		}
		Ok(out)
	}

	// ---- MembershipsBetween ---------------------------------------------

	/// Strictly monotonic NIDs of membership changes for `target` in `room`
	/// with `start_excl < nid <= end_incl`.
	pub fn memberships_between(
		&self,
		room_id: &OwnedRoomId,
		start_excl: Nid,
		end_incl: Nid,
		target: &OwnedUserId,
	) -> Result<Vec<Nid>> {
		let prefix = membership_log_prefix(room_id, target.as_str());
		let mut nids: Vec<Nid> = self
			.membership_log
			.iter_prefix(&prefix)
			.map(|(key, _)| nid_from_suffix(&key, prefix.len()))
			.filter(|&nid| nid > start_excl && nid <= end_incl)
			.collect();
		nids.sort_unstable();
		Ok(nids)
	}

	// ---- Typing -----------------------------------------------------------

	/// Idempotent: if `user_ids` (order-independent) matches the latest
	/// recorded set, returns that version unchanged; otherwise records a new
	/// version.
	pub async fn insert_typing_if_different(
		&self,
		room_id: &OwnedRoomId,
		user_ids: &[OwnedUserId],
	) -> Result<u64> {
		let _guard = self.write_lock.lock().await;

		let mut sorted: Vec<OwnedUserId> = user_ids.to_vec();
		sorted.sort();
		sorted.dedup();

		let existing = self
			.typing
			.get(room_id.as_bytes())?
			.map(|raw| serde_json::from_slice::<TypingRow>(&raw))
			.transpose()
			.map_err(Error::from)?
			.unwrap_or_default();

		let mut existing_sorted = existing.users.clone();
		existing_sorted.sort();

		if existing_sorted == sorted {
			return Ok(existing.version);
		}

		let row = TypingRow { version: existing.version + 1, users: sorted };
		self.typing
			.put(room_id.as_bytes(), serde_json::to_vec(&row).map_err(Error::from)?)?;
		Ok(row.version)
	}

	pub fn typing_users(&self, room_id: &OwnedRoomId) -> Result<(u64, Vec<OwnedUserId>)> {
		let row = self
			.typing
			.get(room_id.as_bytes())?
			.map(|raw| serde_json::from_slice::<TypingRow>(&raw))
			.transpose()
			.map_err(Error::from)?
			.unwrap_or_default();
		Ok((row.version, row.users))
	}

	// ---- To-device --------------------------------------------------------

	pub async fn insert_to_device(
		&self,
		device_id: &ruma_common::OwnedDeviceId,
		msgs: &[serde_json::Value],
	) -> Result<()> {
		let _guard = self.write_lock.lock().await;
		let mut batch = Batch::new();
		let mut last_seq = None;
		for msg in msgs {
			let seq = self.todevice_seq.fetch_add(1, Ordering::SeqCst);
			self.todevice.batch_put(
				&mut batch,
				todevice_key(device_id, seq),
				serde_json::to_vec(msg).map_err(Error::from)?,
			);
			last_seq = Some(seq);
		}
		if let Some(seq) = last_seq {
			self.meta
				.batch_put(&mut batch, META_TODEVICE_SEQ, u64_to_be(seq + 1));
		}
		self.engine.commit(batch)
	}

	pub fn to_device_messages(&self, device_id: &ruma_common::OwnedDeviceId) -> Result<Vec<serde_json::Value>> {
		let prefix = todevice_prefix(device_id);
		self.todevice
			.iter_prefix(&prefix)
			.map(|(_, v)| serde_json::from_slice(&v).map_err(Error::from))
			.collect()
	}

	// ---- Devices ------------------------------------------------------

	pub fn get_device(&self, device_id: &ruma_common::OwnedDeviceId) -> Result<Option<DeviceRecord>> {
		self.devices
			.get(device_id.as_bytes())?
			.map(|raw| serde_json::from_slice(&raw).map_err(Error::from))
			.transpose()
	}

	pub async fn upsert_device(&self, record: &DeviceRecord) -> Result<()> {
		let _guard = self.write_lock.lock().await;
		self.devices
			.put(record.device_id.as_bytes(), serde_json::to_vec(record).map_err(Error::from)?)
	}

	pub async fn update_device_since(&self, device_id: &ruma_common::OwnedDeviceId, since: String) -> Result<()> {
		let _guard = self.write_lock.lock().await;
		let Some(mut record) = self
			.devices
			.get(device_id.as_bytes())?
			.map(|raw| serde_json::from_slice::<DeviceRecord>(&raw))
			.transpose()
			.map_err(Error::from)?
		else {
			return Err(Error::Store("update_device_since: unknown device".into()));
		};
		record.since_token = Some(since);
		self.devices
			.put(device_id.as_bytes(), serde_json::to_vec(&record).map_err(Error::from)?)
	}
}

// ---- key encoding helpers ---------------------------------------------

fn u64_to_be(n: u64) -> [u8; 8] { n.to_be_bytes() }

fn be_to_u64(bytes: &[u8]) -> u64 {
	let mut buf = [0u8; 8];
	buf.copy_from_slice(&bytes[..8]);
	u64::from_be_bytes(buf)
}

fn highest_be_key(map: &Map) -> Option<u64> { map.iter_rev().next().map(|(k, _)| be_to_u64(&k)) }

fn room_id_prefix(room_id: &OwnedRoomId) -> Vec<u8> {
	let mut v = room_id.as_bytes().to_vec();
	v.push(0);
	v
}

fn room_events_key(room_id: &OwnedRoomId, nid: Nid) -> Vec<u8> {
	let mut v = room_id_prefix(room_id);
	v.extend_from_slice(&u64_to_be(nid));
	v
}

fn nid_from_room_events_key(key: &[u8], prefix_len: usize) -> Nid { be_to_u64(&key[prefix_len..]) }

fn membership_log_prefix(room_id: &OwnedRoomId, target_user_id: &str) -> Vec<u8> {
	let mut v = room_id.as_bytes().to_vec();
	v.push(0);
	v.extend_from_slice(target_user_id.as_bytes());
	v.push(0);
	v
}

fn membership_log_key(room_id: &OwnedRoomId, target_user_id: &str, nid: Nid) -> Vec<u8> {
	let mut v = membership_log_prefix(room_id, target_user_id);
	v.extend_from_slice(&u64_to_be(nid));
	v
}

fn nid_from_suffix(key: &[u8], prefix_len: usize) -> Nid { be_to_u64(&key[prefix_len..]) }

fn todevice_prefix(device_id: &ruma_common::OwnedDeviceId) -> Vec<u8> {
	let mut v = device_id.as_bytes().to_vec();
	v.push(0);
	v
}

fn todevice_key(device_id: &ruma_common::OwnedDeviceId, seq: u64) -> Vec<u8> {
	let mut v = todevice_prefix(device_id);
	v.extend_from_slice(&u64_to_be(seq));
	v
}

#[cfg(test)]
mod tests {
	use ruma_common::{OwnedRoomId, OwnedUserId};

	use super::*;

	fn ev(id: &str, room: &str, kind: &str, sender: &str, state_key: Option<&str>, membership: Option<&str>) -> Event {
		Event {
			event_id: id.try_into().unwrap(),
			room_id: <&ruma_common::RoomId>::try_from(room).unwrap().to_owned(),
			kind: kind.to_owned(),
			sender: sender.try_into().unwrap(),
			state_key: state_key.map(ToOwned::to_owned),
			membership: membership.map(ToOwned::to_owned),
			content: serde_json::json!({}),
		}
	}

	async fn open_tmp() -> Arc<Store> {
		let dir = tempfile::tempdir().unwrap();
		// leak the tempdir for the lifetime of the test process; fine for tests.
		let path = Box::leak(Box::new(dir)).path().to_path_buf();
		Store::open(&path).unwrap()
	}

	#[tokio::test]
	async fn initialise_then_accumulate_clobbers_by_slot() {
		let store = open_tmp().await;
		let room: OwnedRoomId = <&ruma_common::RoomId>::try_from("!r:example.org").unwrap().to_owned();

		let a = ev("$a", "!r:example.org", "m.room.create", "@me:example.org", Some(""), None);
		let b = ev("$b", "!r:example.org", "m.room.member", "@me:example.org", Some("@me:example.org"), Some("join"));
		let c = ev("$c", "!r:example.org", "m.room.join_rules", "@me:example.org", Some(""), None);

		let (nids, snap) = store
			.initialise_room(&room, &[a.clone(), b.clone(), c.clone()])
			.await
			.unwrap()
			.expect("first initialise should apply");
		assert_eq!(nids.len(), 3);
		assert_eq!(store.current_snapshot(&room).unwrap(), Some(snap));

		// idempotent re-initialise
		let again = store.initialise_room(&room, &[a, b.clone(), c]).await.unwrap();
		assert!(again.is_none());

		let g = ev("$g", "!r:example.org", "m.room.message", "@me:example.org", None, None);
		let h = ev("$h", "!r:example.org", "m.room.join_rules", "@me:example.org", Some(""), None);
		let i = ev(
			"$i",
			"!r:example.org",
			"m.room.history_visibility",
			"@me:example.org",
			Some(""),
			None,
		);

		let (nids2, num_new, new_snap) = store
			.accumulate_room(&room, &[g.clone(), h.clone(), i.clone()])
			.await
			.unwrap();
		assert_eq!(num_new, 3);
		assert!(new_snap.is_some());

		let current = store.current_snapshot(&room).unwrap().unwrap();
		let state = store.snapshot_nids(current).unwrap();
		// create (A) and join (B) survive; the first join_rules (C) is
		// clobbered by H, and I is new state.
		assert_eq!(state.len(), 4);
		assert!(state.contains(&nids[0])); // A
		assert!(state.contains(&nids[1])); // B (join @me)
		assert!(state.contains(&nids2[1])); // H
		assert!(state.contains(&nids2[2])); // I

		// re-running with an all-duplicate batch is a no-op.
		let (_, num_new_repeat, snap_repeat) = store.accumulate_room(&room, &[g, h, i]).await.unwrap();
		assert_eq!(num_new_repeat, 0);
		assert!(snap_repeat.is_none());
	}

	#[tokio::test]
	async fn delta_pagination() {
		let store = open_tmp().await;
		let room: OwnedRoomId = <&ruma_common::RoomId>::try_from("!r:example.org").unwrap().to_owned();
		let a = ev("$a", "!r:example.org", "m.room.create", "@me:example.org", Some(""), None);
		let b = ev("$b", "!r:example.org", "m.room.member", "@me:example.org", Some("@me:example.org"), Some("join"));
		let c = ev("$c", "!r:example.org", "m.room.join_rules", "@me:example.org", Some(""), None);
		let (nids, _) = store.initialise_room(&room, &[a, b, c]).await.unwrap().unwrap();

		let g = ev("$g", "!r:example.org", "m.room.message", "@me:example.org", None, None);
		let h = ev("$h", "!r:example.org", "m.room.join_rules", "@me:example.org", Some(""), None);
		let i = ev(
			"$i",
			"!r:example.org",
			"m.room.history_visibility",
			"@me:example.org",
			Some(""),
			None,
		);
		store.accumulate_room(&room, &[g, h, i]).await.unwrap();

		let (page1, pos1) = store.delta(&room, EVENTS_START, 1).unwrap();
		assert_eq!(page1.len(), 1);
		assert_eq!(page1[0].event_id.as_str(), "$a");
		assert_eq!(pos1, nids[0]);

		let (rest, _) = store.delta(&room, pos1, 1000).unwrap();
		assert_eq!(rest.len(), 5);
		assert_eq!(rest.last().unwrap().event_id.as_str(), "$i");
	}

	#[tokio::test]
	async fn membership_log_scenario() {
		let store = open_tmp().await;
		let room: OwnedRoomId = <&ruma_common::RoomId>::try_from("!r:example.org").unwrap().to_owned();
		let me: OwnedUserId = "@me:example.org".try_into().unwrap();
		let bob: OwnedUserId = "@bob:example.org".try_into().unwrap();

		let create = ev("$b1", "!r:example.org", "m.room.create", "@me:example.org", Some(""), None);
		let join_me = ev("$b2", "!r:example.org", "m.room.member", "@me:example.org", Some("@me:example.org"), Some("join"));
		let join_rules = ev("$b3", "!r:example.org", "m.room.join_rules", "@me:example.org", Some(""), None);
		let join_alice = ev(
			"$b4",
			"!r:example.org",
			"m.room.member",
			"@alice:example.org",
			Some("@alice:example.org"),
			Some("join"),
		);
		let message = ev("$b5", "!r:example.org", "m.room.message", "@me:example.org", None, None);
		let rename_me = ev("$b6", "!r:example.org", "m.room.member", "@me:example.org", Some("@me:example.org"), Some("join"));
		let invite_bob = ev(
			"$b7",
			"!r:example.org",
			"m.room.member",
			"@me:example.org",
			Some("@bob:example.org"),
			Some("invite"),
		);
		let leave_me = ev("$b8", "!r:example.org", "m.room.member", "@me:example.org", Some("@me:example.org"), Some("leave"));

		let (nids1, _) = store.initialise_room(&room, &[create, join_me]).await.unwrap().unwrap();
		let (nids2, ..) = store
			.accumulate_room(&room, &[join_rules, join_alice, message, rename_me, invite_bob, leave_me])
			.await
			.unwrap();

		let all_nids: Vec<Nid> = nids1.iter().chain(nids2.iter()).copied().collect();
		let b8 = *all_nids.last().unwrap();
		let b7 = all_nids[all_nids.len() - 2];
		let b3 = all_nids[2];

		assert_eq!(store.memberships_between(&room, 0, b8, &me).unwrap(), vec![all_nids[1], b8]);
		assert_eq!(store.memberships_between(&room, 0, b8, &bob).unwrap(), vec![b7]);
		assert_eq!(store.memberships_between(&room, b3, b7, &me).unwrap(), Vec::<Nid>::new());
	}

	#[tokio::test]
	async fn typing_is_idempotent() {
		let store = open_tmp().await;
		let room: OwnedRoomId = <&ruma_common::RoomId>::try_from("!r:example.org").unwrap().to_owned();
		let a: OwnedUserId = "@a:example.org".try_into().unwrap();
		let b: OwnedUserId = "@b:example.org".try_into().unwrap();

		let v1 = store.insert_typing_if_different(&room, &[a.clone()]).await.unwrap();
		let v1_again = store.insert_typing_if_different(&room, &[a.clone()]).await.unwrap();
		assert_eq!(v1, v1_again);

		let v2 = store.insert_typing_if_different(&room, &[a, b]).await.unwrap();
		assert!(v2 > v1);
	}

	#[tokio::test]
	async fn zero_limit_timeline_never_panics() {
		let store = open_tmp().await;
		let room: OwnedRoomId = <&ruma_common::RoomId>::try_from("!r:example.org").unwrap().to_owned();
		let a = ev("$a", "!r:example.org", "m.room.create", "@me:example.org", Some(""), None);
		store.initialise_room(&room, &[a]).await.unwrap();
		assert!(store.latest_events(&room, 0).unwrap().is_empty());
	}
}
