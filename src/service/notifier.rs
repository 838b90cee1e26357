//! §4.4 Notifier. Purely in-memory: a `roomID -> set<userID>` joined-members
//! index (seeded once at startup from `Store::all_joined_members`) and a
//! `userID -> set<ConnID>` fan-out index, plus the registry of live
//! `Connection`s it owns (§4.5, §9 "Notifier owns Connections").

use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
};

use ruma_common::{OwnedRoomId, OwnedUserId};
use sync3_core::Result;
use tokio::sync::RwLock;

use crate::{
	connection::{ConnId, Connection},
	store::Store,
};

/// A membership mutation observed on a state event, applied to the joined
/// index *before* fanout (§4.4).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MembershipChange {
	Joined,
	Left,
}

struct Indices {
	room_members: HashMap<OwnedRoomId, HashSet<OwnedUserId>>,
	user_conns: HashMap<OwnedUserId, HashSet<ConnId>>,
}

/// In-memory fan-out hub. Single-writer per room is the caller's
/// responsibility (the Accumulator serializes `Initialise`/`Accumulate` per
/// room already, per §5); this type itself only needs interior mutability,
/// not per-room locks, because `RwLock` already serializes writers against
/// each other workspace-wide.
pub struct Notifier {
	indices: RwLock<Indices>,
	conns: RwLock<HashMap<ConnId, Arc<Connection>>>,
}

impl Notifier {
	/// Loads `AllJoinedMembers()` once at startup to seed the joined index.
	pub async fn new(store: Arc<Store>) -> Result<Arc<Self>> {
		let room_members = store
			.all_joined_members()?
			.into_iter()
			.map(|(room, members)| (room, members.into_iter().collect::<HashSet<_>>()))
			.collect();

		Ok(Arc::new(Self {
			indices: RwLock::new(Indices { room_members, user_conns: HashMap::new() }),
			conns: RwLock::new(HashMap::new()),
		}))
	}

	/// A membership event changed `target`'s standing in `room`; mutate the
	/// joined index before any fanout sees the new state (§4.4).
	pub async fn apply_membership(&self, room_id: &OwnedRoomId, target: &OwnedUserId, change: MembershipChange) {
		let mut indices = self.indices.write().await;
		let members = indices.room_members.entry(room_id.clone()).or_default();
		match change {
			| MembershipChange::Joined => {
				members.insert(target.clone());
			},
			| MembershipChange::Left => {
				members.remove(target);
			},
		}
	}

	/// Delivers an asynchronous wake-up to every Connection belonging to a
	/// user joined to `room_id`. The signal only carries enough for the
	/// Connection to know "something changed in this room" — it refetches
	/// details itself from the Store.
	pub async fn on_new_event(&self, room_id: &OwnedRoomId) {
		let members: Vec<OwnedUserId> = {
			let indices = self.indices.read().await;
			indices
				.room_members
				.get(room_id)
				.map(|s| s.iter().cloned().collect())
				.unwrap_or_default()
		};

		if members.is_empty() {
			return;
		}

		let conn_ids: Vec<ConnId> = {
			let indices = self.indices.read().await;
			members
				.iter()
				.filter_map(|u| indices.user_conns.get(u))
				.flatten()
				.cloned()
				.collect()
		};

		let conns = self.conns.read().await;
		for conn_id in conn_ids {
			if let Some(conn) = conns.get(&conn_id) {
				conn.mark_dirty(room_id.clone());
			}
		}
	}

	/// Atomic get-or-create: the first caller for a `ConnID` creates the
	/// Connection and registers it in both the registry and the
	/// `userID -> ConnID` index; subsequent callers just look it up.
	pub async fn get_or_create_conn(&self, conn_id: ConnId, user_id: OwnedUserId) -> (Arc<Connection>, bool) {
		{
			let conns = self.conns.read().await;
			if let Some(conn) = conns.get(&conn_id) {
				return (conn.clone(), false);
			}
		}

		let mut conns = self.conns.write().await;
		if let Some(conn) = conns.get(&conn_id) {
			return (conn.clone(), false);
		}

		let conn = Arc::new(Connection::new(conn_id.clone(), user_id.clone()));
		conns.insert(conn_id.clone(), conn.clone());

		let mut indices = self.indices.write().await;
		indices
			.user_conns
			.entry(user_id)
			.or_default()
			.insert(conn_id);

		(conn, true)
	}

	/// Lookup only — does not create.
	pub async fn conn(&self, conn_id: &ConnId) -> Option<Arc<Connection>> { self.conns.read().await.get(conn_id).cloned() }

	/// Every room `user_id` is currently joined to, per the in-memory index
	/// (§4.5 "room ordering" draws its universe from exactly this set).
	pub async fn rooms_for_user(&self, user_id: &OwnedUserId) -> Vec<OwnedRoomId> {
		let indices = self.indices.read().await;
		indices
			.room_members
			.iter()
			.filter(|(_, members)| members.contains(user_id))
			.map(|(room_id, _)| room_id.clone())
			.collect()
	}

	/// Removes a Connection that has been idle past its TTL (§5). The next
	/// request bearing its session will fail `ErrExpiredSession`.
	pub async fn evict(&self, conn_id: &ConnId) {
		let removed = self.conns.write().await.remove(conn_id);
		if let Some(conn) = removed {
			let mut indices = self.indices.write().await;
			if let Some(set) = indices.user_conns.get_mut(conn.user_id()) {
				set.remove(conn_id);
			}
		}
	}

	/// Sweeps every registered Connection and evicts those idle past
	/// `ttl_secs`. Intended to be driven by a periodic task at the binary's
	/// top level.
	pub async fn evict_idle(&self, ttl_secs: u64) {
		let expired: Vec<ConnId> = {
			let conns = self.conns.read().await;
			conns
				.values()
				.filter(|conn| conn.idle_for_secs() >= ttl_secs)
				.map(|conn| conn.id().clone())
				.collect()
		};
		for conn_id in expired {
			tracing::debug!(?conn_id, "evicting idle connection");
			self.evict(&conn_id).await;
		}
	}
}
