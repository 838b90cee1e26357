//! §4.5 Connection / List engine. One state machine per `ConnID`: sorted
//! room list, window(s), per-request delta computation, and the
//! request/response replay buffer that makes a client's retry idempotent.

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	sync::Mutex as StdMutex,
	time::{Duration, Instant},
};

use rand::RngCore;
use ruma_common::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use sync3_core::Pos;
use tokio::sync::{Mutex as AsyncMutex, Notify, oneshot};

use crate::list::{self, Op};

/// `(device_id, session_id)` (§3 "Connection"). Per SPEC_FULL.md §9 /
/// spec.md's open question #1, `session_id` must be collision-resistant —
/// unlike the placeholder that always returns `"1"` in the source this
/// proxy is modelled on, `new_session_id` draws from the OS RNG.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConnId {
	pub device_id: OwnedDeviceId,
	pub session_id: String,
}

impl ConnId {
	#[must_use]
	pub fn new(device_id: OwnedDeviceId, session_id: String) -> Self { Self { device_id, session_id } }
}

/// Generates a collision-resistant session id: 16 random bytes, hex
/// encoded.
#[must_use]
pub fn new_session_id() -> String {
	let mut bytes = [0u8; 16];
	rand::thread_rng().fill_bytes(&mut bytes);
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A client-declared list: an ordered set of non-overlapping index ranges
/// plus a timeline limit (§6 wire contract).
#[derive(Clone, Debug)]
pub struct ListRequest {
	pub ranges: Vec<(usize, usize)>,
	pub timeline_limit: u32,
}

/// What the Connection remembers about one named list between requests.
#[derive(Default)]
struct ListState {
	/// Previous window contents, keyed by range, in the same order the
	/// client requested them.
	windows: BTreeMap<(usize, usize), Vec<OwnedRoomId>>,
}

struct ConnState {
	last_pos: Pos,
	last_response: Option<Vec<u8>>,
	lists: HashMap<String, ListState>,
	/// Rooms this Connection has sent at least one payload for — governs
	/// the `initial` flag (§4.5 "First-seen flag").
	rooms_loaded: HashSet<OwnedRoomId>,
}

/// One row of a `tick()` result: the ops for one named list plus the total
/// room count it draws from (§6 `count`).
pub struct ListTick {
	pub ops: Vec<Op>,
	pub count: usize,
}

/// Everything a `/sync` response needs to be assembled: per-list ops plus
/// the set of rooms that need a payload (new arrivals and updated rooms),
/// each tagged with whether this is the first time this Connection has
/// seen it.
pub struct Tick {
	pub pos: Pos,
	pub lists: HashMap<String, ListTick>,
	pub rooms: HashMap<OwnedRoomId, bool>,
}

/// Outcome of matching an incoming request's `pos` against what this
/// Connection last sent (§4.5 "Long-poll / request lifecycle", steps 3–5).
pub enum PosCheck {
	/// No `pos` was given (brand-new session) or it matches the last
	/// response: compute fresh ops.
	Process,
	/// One less than last-served: the client is retrying. Replay bytes.
	Replay(Vec<u8>),
	/// Anything else.
	Expired,
}

/// Outcome of `Connection::wait_for_activity` (§4.5 step 6, §5
/// "Cancellation").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
	/// The Notifier signalled relevant activity: recompute ops.
	Activity,
	/// `timeout` elapsed with nothing to report.
	Timeout,
	/// A second concurrent request for this `ConnID` superseded this one;
	/// emit no response and do not advance `pos`.
	Superseded,
}

pub struct Connection {
	conn_id: ConnId,
	user_id: OwnedUserId,
	state: AsyncMutex<ConnState>,
	dirty_rooms: StdMutex<HashSet<OwnedRoomId>>,
	wake: Notify,
	last_activity: StdMutex<Instant>,
	inflight_cancel: AsyncMutex<Option<oneshot::Sender<()>>>,
}

impl Connection {
	#[must_use]
	pub fn new(conn_id: ConnId, user_id: OwnedUserId) -> Self {
		Self {
			conn_id,
			user_id,
			state: AsyncMutex::new(ConnState {
				last_pos: 0,
				last_response: None,
				lists: HashMap::new(),
				rooms_loaded: HashSet::new(),
			}),
			dirty_rooms: StdMutex::new(HashSet::new()),
			wake: Notify::new(),
			last_activity: StdMutex::new(Instant::now()),
			inflight_cancel: AsyncMutex::new(None),
		}
	}

	#[must_use]
	pub fn id(&self) -> &ConnId { &self.conn_id }

	#[must_use]
	pub fn user_id(&self) -> &OwnedUserId { &self.user_id }

	/// Called by the Notifier when a room this Connection's user is joined
	/// to has new activity (§4.4).
	pub fn mark_dirty(&self, room_id: OwnedRoomId) {
		self.dirty_rooms.lock().unwrap().insert(room_id);
		self.wake.notify_waiters();
	}

	fn touch(&self) { *self.last_activity.lock().unwrap() = Instant::now(); }

	#[must_use]
	pub fn idle_for_secs(&self) -> u64 { self.last_activity.lock().unwrap().elapsed().as_secs() }

	/// §4.5 steps 3–5: decide whether to compute fresh ops, replay the
	/// cached response, or reject as expired.
	pub async fn check_pos(&self, pos: Option<Pos>) -> PosCheck {
		self.touch();
		let state = self.state.lock().await;
		match pos {
			| None => PosCheck::Process,
			| Some(p) if p == state.last_pos => PosCheck::Process,
			| Some(p) if state.last_response.is_some() && p == state.last_pos - 1 =>
				PosCheck::Replay(state.last_response.clone().expect("checked above")),
			| _ => PosCheck::Expired,
		}
	}

	/// Registers this request as the sole inflight one for this `ConnID`,
	/// cancelling any request that was already in flight (§4.5 "Only one
	/// inflight request per ConnID is permitted"). Returns a receiver that
	/// resolves when *this* request is itself superseded.
	pub async fn begin_request(&self) -> oneshot::Receiver<()> {
		let (tx, rx) = oneshot::channel();
		let previous = self.inflight_cancel.lock().await.replace(tx);
		if let Some(previous) = previous {
			let _ = previous.send(());
		}
		rx
	}

	/// Suspends until the Notifier wakes this Connection for relevant
	/// activity, the request is superseded, or `timeout` elapses (§4.5
	/// step 6).
	pub async fn wait_for_activity(&self, timeout: Duration, cancel: &mut oneshot::Receiver<()>) -> WaitOutcome {
		tokio::select! {
			() = self.wake.notified() => WaitOutcome::Activity,
			() = tokio::time::sleep(timeout) => WaitOutcome::Timeout,
			_ = &mut *cancel => WaitOutcome::Superseded,
		}
	}

	/// Computes the new tick: sorted room list per list's window(s), the
	/// diff against what was last sent, and the set of rooms needing a
	/// payload. `rooms_with_nid` is the full set of rooms in scope (the
	/// user's joined rooms) with their most-recent-activity NID.
	pub async fn tick(
		&self,
		requests: &BTreeMap<String, ListRequest>,
		rooms_with_nid: Vec<(OwnedRoomId, u64)>,
	) -> Tick {
		let sorted = list::sort_rooms(rooms_with_nid);
		let dirty: HashSet<OwnedRoomId> = std::mem::take(&mut *self.dirty_rooms.lock().unwrap());

		let mut state = self.state.lock().await;
		let mut lists = HashMap::new();
		let mut rooms: HashMap<OwnedRoomId, bool> = HashMap::new();

		for (name, req) in requests {
			let list_state = state.lists.entry(name.clone()).or_default();
			let mut ops = Vec::new();

			// Ranges this list previously held a window for but is no
			// longer requesting (shrunk or moved away entirely) are no
			// longer covered by anything the client asked for: tell it
			// to forget them rather than leaving them stale (§4.5
			// `INVALIDATE`).
			let current_ranges: HashSet<(usize, usize)> = req.ranges.iter().copied().collect();
			let stale_ranges: Vec<(usize, usize)> =
				list_state.windows.keys().copied().filter(|r| !current_ranges.contains(r)).collect();
			for range in stale_ranges {
				list_state.windows.remove(&range);
				ops.push(Op::Invalidate { range });
			}

			for &range in &req.ranges {
				let (lo, hi) = range;
				let hi = hi.min(sorted.len().saturating_sub(1).max(lo));
				let new_window: Vec<OwnedRoomId> =
					sorted.iter().skip(lo).take(hi.saturating_sub(lo) + 1).cloned().collect();

				let prev_window = list_state.windows.remove(&range).unwrap_or_default();
				let range_ops = list::diff_window(range, &prev_window, &new_window, &dirty);

				for op in &range_ops {
					match op {
						| Op::Insert { room_id, .. } | Op::Update { room_id, .. } => {
							let initial = !state.rooms_loaded.contains(room_id);
							rooms.insert(room_id.clone(), initial);
						},
						| Op::Sync { rooms: r, .. } =>
							for room_id in r {
								let initial = !state.rooms_loaded.contains(room_id);
								rooms.insert(room_id.clone(), initial);
							},
						| Op::Delete { .. } | Op::Invalidate { .. } => {},
					}
				}

				list_state.windows.insert(range, new_window);
				ops.extend(range_ops);
			}

			let count = sorted.len();
			lists.insert(name.clone(), ListTick { ops, count });
		}

		for room_id in rooms.keys() {
			state.rooms_loaded.insert(room_id.clone());
		}

		let pos = state.last_pos + 1;
		Tick { pos, lists, rooms }
	}

	/// Commits a successfully-assembled response: advances `pos` and
	/// caches the bytes for a single retry (§4.5 step 4). Not advancing on
	/// cancellation is the caller's responsibility — simply don't call
	/// this when the request was cancelled (§5 "Cancellation").
	pub async fn commit_response(&self, pos: Pos, bytes: Vec<u8>) {
		let mut state = self.state.lock().await;
		state.last_pos = pos;
		state.last_response = Some(bytes);
	}

	/// Commits a timed-out response (no ops, refreshed `pos`, nothing to
	/// replay) — spec.md §4.5 step 6.
	pub async fn commit_timeout(&self, pos: Pos) {
		let mut state = self.state.lock().await;
		state.last_pos = pos;
		state.last_response = None;
	}
}

#[cfg(test)]
mod tests {
	use ruma_common::{OwnedDeviceId, RoomId};

	use super::*;

	fn room(n: u32) -> OwnedRoomId { <&RoomId>::try_from(format!("!r{n}:example.org").as_str()).unwrap().to_owned() }

	fn device() -> OwnedDeviceId { "DEVICE".try_into().unwrap() }

	fn user() -> OwnedUserId { "@me:example.org".try_into().unwrap() }

	#[tokio::test]
	async fn first_tick_is_a_sync_and_marks_rooms_initial() {
		let conn = Connection::new(ConnId::new(device(), new_session_id()), user());
		let mut requests = BTreeMap::new();
		requests.insert("main".to_owned(), ListRequest { ranges: vec![(0, 2)], timeline_limit: 3 });

		let rooms_with_nid = vec![(room(1), 10), (room(2), 20), (room(3), 30)];
		let tick = conn.tick(&requests, rooms_with_nid).await;

		let list = &tick.lists["main"];
		assert_eq!(list.ops.len(), 1);
		assert!(matches!(&list.ops[0], Op::Sync { rooms, .. } if rooms.len() == 3));
		assert!(tick.rooms.values().all(|&initial| initial));
	}

	#[tokio::test]
	async fn pos_check_matches_spec_transitions() {
		let conn = Connection::new(ConnId::new(device(), new_session_id()), user());
		assert!(matches!(conn.check_pos(None).await, PosCheck::Process));

		conn.commit_response(1, b"resp1".to_vec()).await;
		assert!(matches!(conn.check_pos(Some(1)).await, PosCheck::Process));
		assert!(matches!(conn.check_pos(Some(0)).await, PosCheck::Replay(_)));
		assert!(matches!(conn.check_pos(Some(99)).await, PosCheck::Expired));
	}

	#[tokio::test]
	async fn second_request_cancels_the_first() {
		let conn = Connection::new(ConnId::new(device(), new_session_id()), user());
		let mut first_cancel = conn.begin_request().await;
		let _second_cancel = conn.begin_request().await;
		assert!(first_cancel.try_recv().is_ok());
	}

	#[test]
	fn session_ids_are_not_constant() {
		assert_ne!(new_session_id(), new_session_id());
	}

	#[tokio::test]
	async fn shrinking_a_range_invalidates_the_vacated_indices() {
		let conn = Connection::new(ConnId::new(device(), new_session_id()), user());
		let rooms_with_nid: Vec<(OwnedRoomId, u64)> =
			(0..10).map(|n| (room(n), u64::from(n))).collect();

		let mut requests = BTreeMap::new();
		requests.insert("main".to_owned(), ListRequest { ranges: vec![(0, 9)], timeline_limit: 0 });
		conn.tick(&requests, rooms_with_nid.clone()).await;

		requests.insert("main".to_owned(), ListRequest { ranges: vec![(0, 4)], timeline_limit: 0 });
		let tick = conn.tick(&requests, rooms_with_nid).await;

		let list = &tick.lists["main"];
		assert!(list.ops.contains(&Op::Invalidate { range: (0, 9) }));
	}
}
